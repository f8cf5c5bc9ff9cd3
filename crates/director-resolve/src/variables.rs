//! Variable sets: which value every placeholder had for a given deploy.

use std::collections::{BTreeMap, BTreeSet};

use director_core::epoch_ms;
use director_core::manifest::VariableSpec;
use director_state::{StateError, StateStore, Variable, VariableSet};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ResolveError, ResolveResult};
use crate::generate::generate;
use crate::placeholder::{interpolate, Placeholder};

#[derive(Clone)]
pub struct VariableResolver {
    store: StateStore,
    director: String,
}

impl VariableResolver {
    pub fn new(store: StateStore, director: &str) -> Self {
        Self {
            store,
            director: director.to_string(),
        }
    }

    /// Absolute names are kept; relative ones live under
    /// `/<director>/<deployment>/`.
    pub fn qualified_name(&self, deployment: &str, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}/{}/{}", self.director, deployment, name)
        }
    }

    // ── Set lifecycle ──────────────────────────────────────────────

    /// Open the writable set a deploy pins for its whole run.
    pub fn start_set(&self, deployment: &str) -> ResolveResult<VariableSet> {
        let set = self.store.create_variable_set(deployment, true, epoch_ms())?;
        debug!(deployment = %deployment, set_id = set.id, "variable set started");
        Ok(set)
    }

    pub fn current_set(&self, deployment: &str) -> ResolveResult<Option<VariableSet>> {
        Ok(self.store.current_variable_set(deployment)?)
    }

    pub fn mark_deployed(&self, set: &mut VariableSet) -> ResolveResult<()> {
        set.deployed_successfully = true;
        self.store.update_variable_set(set)?;
        Ok(())
    }

    /// Freeze a set at the end of a deploy attempt, successful or not.
    pub fn close_set(&self, set: &mut VariableSet) -> ResolveResult<()> {
        set.writable = false;
        self.store.update_variable_set(set)?;
        Ok(())
    }

    /// Delete sets that are neither current nor still referenced by an
    /// instance. Returns the deleted ids.
    pub fn cleanup_unused(&self, deployment: &str) -> ResolveResult<Vec<u64>> {
        let mut sets = self.store.list_variable_sets(deployment)?;
        let Some(current) = sets.pop() else {
            return Ok(Vec::new());
        };
        let referenced: BTreeSet<u64> = self
            .store
            .list_instances(deployment)?
            .into_iter()
            .filter_map(|i| i.variable_set_id)
            .collect();

        let mut removed = Vec::new();
        for set in sets {
            if set.id != current.id && !referenced.contains(&set.id) {
                self.store.delete_variable_set(deployment, set.id)?;
                removed.push(set.id);
            }
        }
        if !removed.is_empty() {
            info!(deployment = %deployment, removed = ?removed, "unused variable sets deleted");
        }
        Ok(removed)
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Newest version of `name` across the deployment's sets, current set
    /// first, then older sets newest to oldest.
    pub fn find_variable_by_name(&self, deployment: &str, name: &str) -> ResolveResult<Option<Variable>> {
        let qualified = self.qualified_name(deployment, name);
        for set in self.store.list_variable_sets(deployment)?.iter().rev() {
            if let Some(var) = self.store.get_variable(set.id, &qualified, "")? {
                return Ok(Some(var));
            }
        }
        Ok(None)
    }

    /// The value of `name` in `set`, versioning it into the set on first use.
    ///
    /// A closed set only answers with values it already holds. An open set
    /// carries forward the newest earlier value, or generates one for a
    /// declared variable.
    pub fn value_in_set(&self, set: &VariableSet, specs: &[VariableSpec], name: &str) -> ResolveResult<Value> {
        let qualified = self.qualified_name(&set.deployment, name);
        if let Some(var) = self.store.get_variable(set.id, &qualified, "")? {
            return Ok(var.value);
        }
        if !set.writable {
            return Err(ResolveError::NotVersioned {
                name: qualified,
                deployment: set.deployment.clone(),
            });
        }

        let value = match self.previous_value(set, &qualified)? {
            Some(value) => value,
            None => {
                let spec = specs
                    .iter()
                    .find(|s| self.qualified_name(&set.deployment, &s.name) == qualified)
                    .ok_or_else(|| ResolveError::VariableNotFound(qualified.clone()))?;
                debug!(variable = %qualified, kind = %spec.kind, "generating variable");
                generate(spec)?
            }
        };

        let variable = Variable {
            set_id: set.id,
            name: qualified.clone(),
            variable_id: uuid::Uuid::new_v4().to_string(),
            value,
            is_local: true,
            provider_deployment: String::new(),
        };
        match self.store.put_variable(&variable) {
            Ok(()) => Ok(variable.value),
            // Someone versioned it first; theirs wins.
            Err(StateError::Conflict(_)) => self
                .store
                .get_variable(set.id, &qualified, "")?
                .map(|v| v.value)
                .ok_or(ResolveError::VariableNotFound(qualified)),
            Err(e) => Err(e.into()),
        }
    }

    fn previous_value(&self, set: &VariableSet, qualified: &str) -> ResolveResult<Option<Value>> {
        for older in self.store.list_variable_sets(&set.deployment)?.iter().rev() {
            if older.id == set.id {
                continue;
            }
            if let Some(var) = self.store.get_variable(older.id, qualified, "")? {
                return Ok(Some(var.value));
            }
        }
        Ok(None)
    }

    /// Version every declared variable into `set`.
    pub fn ensure_declared(&self, set: &VariableSet, specs: &[VariableSpec]) -> ResolveResult<()> {
        for spec in specs {
            self.value_in_set(set, specs, &spec.name)?;
        }
        Ok(())
    }

    /// Resolve all placeholders in `value` against `set`.
    pub fn interpolate(&self, set: &VariableSet, specs: &[VariableSpec], value: &Value) -> ResolveResult<Value> {
        let mut cache: BTreeMap<String, Value> = BTreeMap::new();
        let mut lookup = |p: &Placeholder| -> ResolveResult<Value> {
            let whole = match cache.get(&p.name) {
                Some(v) => v.clone(),
                None => {
                    let v = self.value_in_set(set, specs, &p.name)?;
                    cache.insert(p.name.clone(), v.clone());
                    v
                }
            };
            p.select(&whole)
        };
        interpolate(value, &mut lookup)
    }

    /// Record a provider deployment's variable in a consumer's set.
    pub fn import_from_provider(
        &self,
        set: &VariableSet,
        provider_deployment: &str,
        name: &str,
    ) -> ResolveResult<Value> {
        let qualified = self.qualified_name(provider_deployment, name);
        if let Some(var) = self.store.get_variable(set.id, &qualified, provider_deployment)? {
            return Ok(var.value);
        }
        let source = self
            .find_variable_by_name(provider_deployment, &qualified)?
            .ok_or_else(|| ResolveError::VariableNotFound(qualified.clone()))?;
        if !set.writable {
            return Err(ResolveError::NotVersioned {
                name: qualified,
                deployment: set.deployment.clone(),
            });
        }
        let variable = Variable {
            set_id: set.id,
            name: qualified,
            variable_id: source.variable_id,
            value: source.value,
            is_local: false,
            provider_deployment: provider_deployment.to_string(),
        };
        self.store.put_variable(&variable)?;
        Ok(variable.value)
    }
}
