//! Link resolution.
//!
//! `collect_intents` turns a manifest plus its release job definitions into
//! provider and consumer rows. `LinkResolver` joins consumers against every
//! visible provider and records each binding as a `Link` row; a deploy
//! renders from those rows.

use std::collections::{BTreeMap, BTreeSet};

use director_core::epoch_ms;
use director_core::manifest::{DeploymentManifest, InstanceGroupSpec, JobSpec, Properties};
use director_state::{Link, LinkConsumer, LinkProvider, ReleaseJob, ReleaseVersion, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{LinkFailure, LinkFailureKind, ResolveError, ResolveResult};

/// One instance as it appears in provider link content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub name: String,
    pub index: u32,
    pub id: String,
    pub az: Option<String>,
    pub address: String,
    pub bootstrap: bool,
}

// ── Intents ─────────────────────────────────────────────────────────

/// Providers and consumers declared by `manifest`.
///
/// `addresses` lists the planned instances of each instance group; it
/// feeds the `instances` section of provider content.
pub fn collect_intents(
    manifest: &DeploymentManifest,
    releases: &[ReleaseVersion],
    addresses: &BTreeMap<String, Vec<InstanceAddress>>,
) -> (Vec<LinkProvider>, Vec<LinkConsumer>) {
    let mut providers = Vec::new();
    let mut consumers = Vec::new();
    for group in &manifest.instance_groups {
        let instances = addresses.get(&group.name).map(Vec::as_slice).unwrap_or_default();
        for job in &group.jobs {
            let definition = releases
                .iter()
                .find(|r| r.name == job.release)
                .and_then(|r| r.job(&job.name));
            let defaults = definition.map(|d| &d.properties);
            let properties = job_properties(manifest, group, job);

            for def in definition.map(|d| d.provides.as_slice()).unwrap_or_default() {
                let spec = job.provides.get(&def.name);
                let consumable = !matches!(spec, Some(None));
                let spec = spec.cloned().flatten().unwrap_or_default();
                providers.push(LinkProvider {
                    deployment: manifest.name.clone(),
                    instance_group: group.name.clone(),
                    job: job.name.clone(),
                    original_name: def.name.clone(),
                    name: spec.alias.clone().unwrap_or_else(|| def.name.clone()),
                    link_type: spec.link_type.clone().unwrap_or_else(|| def.link_type.clone()),
                    content: provider_content(&manifest.name, group, &def.properties, &properties, defaults, instances),
                    shared: spec.shared,
                    consumable,
                });
            }
            for custom in &job.custom_provider_definitions {
                providers.push(LinkProvider {
                    deployment: manifest.name.clone(),
                    instance_group: group.name.clone(),
                    job: job.name.clone(),
                    original_name: custom.name.clone(),
                    name: custom.name.clone(),
                    link_type: custom.link_type.clone(),
                    content: provider_content(&manifest.name, group, &custom.properties, &properties, defaults, instances),
                    shared: false,
                    consumable: true,
                });
            }

            for def in definition.map(|d| d.consumes.as_slice()).unwrap_or_default() {
                let spec = job.consumes.get(&def.name);
                let blocked = matches!(spec, Some(None));
                let spec = spec.cloned().flatten().unwrap_or_default();
                let manual_content = spec.is_manual().then(|| {
                    let mut content = spec.manual_content();
                    if let Value::Object(map) = &mut content {
                        map.insert("deployment_name".to_string(), Value::String(manifest.name.clone()));
                    }
                    content
                });
                consumers.push(LinkConsumer {
                    deployment: manifest.name.clone(),
                    instance_group: group.name.clone(),
                    job: job.name.clone(),
                    original_name: def.name.clone(),
                    link_type: spec.link_type.clone().unwrap_or_else(|| def.link_type.clone()),
                    from: spec.from.clone(),
                    provider_deployment: spec.deployment.clone(),
                    optional: def.optional || spec.optional,
                    blocked,
                    manual_content,
                });
            }
        }
    }
    (providers, consumers)
}

/// Job properties fall back to instance group properties, then to the
/// manifest's global properties.
fn job_properties(manifest: &DeploymentManifest, group: &InstanceGroupSpec, job: &JobSpec) -> Properties {
    if !job.properties.is_empty() {
        job.properties.clone()
    } else if !group.properties.is_empty() {
        group.properties.clone()
    } else {
        manifest.properties.clone()
    }
}

fn provider_content(
    deployment: &str,
    group: &InstanceGroupSpec,
    exported: &[String],
    properties: &Properties,
    defaults: Option<&Map<String, Value>>,
    instances: &[InstanceAddress],
) -> Value {
    let mut exported_props = Map::new();
    for path in exported {
        let value = lookup_path(properties, path).cloned().or_else(|| {
            defaults
                .and_then(|d| d.get(path))
                .and_then(|def| def.get("default"))
                .cloned()
        });
        insert_path(&mut exported_props, path, value.unwrap_or(Value::Null));
    }
    let default_network = group
        .networks
        .iter()
        .find(|n| n.default.iter().any(|d| d == "gateway"))
        .or_else(|| group.networks.first())
        .map(|n| n.name.clone());
    json!({
        "deployment_name": deployment,
        "instance_group": group.name,
        "default_network": default_network,
        "networks": group.networks.iter().map(|n| n.name.clone()).collect::<Vec<_>>(),
        "properties": exported_props,
        "instances": instances,
    })
}

/// Look up `a.b.c` in nested maps.
pub fn lookup_path<'a>(properties: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = properties.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Set `a.b.c` in nested maps, creating intermediate maps.
pub fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else { return };
    let mut current = target;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else { return };
        current = next;
    }
    current.insert(last.to_string(), value);
}

// ── Resolution ──────────────────────────────────────────────────────

/// Link content per `(instance group, job)`, keyed by link name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedLinks {
    by_job: BTreeMap<(String, String), BTreeMap<String, Value>>,
}

impl ResolvedLinks {
    pub fn for_job(&self, group: &str, job: &str) -> BTreeMap<String, Value> {
        self.by_job
            .get(&(group.to_string(), job.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_job.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a consumer's content comes from.
#[derive(Debug, Clone, PartialEq)]
struct Binding {
    source: String,
    content: Value,
}

#[derive(Clone)]
pub struct LinkResolver {
    store: StateStore,
}

impl LinkResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Resolve every consumer without writing anything.
    pub fn resolve(
        &self,
        deployment: &str,
        providers: &[LinkProvider],
        consumers: &[LinkConsumer],
    ) -> ResolveResult<ResolvedLinks> {
        let bindings = self.bindings(deployment, providers, consumers)?;
        Ok(collect(consumers, &bindings))
    }

    /// Resolve, then persist providers, consumers and the resulting links.
    /// Nothing is written when any required consumer fails to resolve.
    /// The returned content is read back from the link rows.
    pub fn bind(
        &self,
        deployment: &str,
        providers: &[LinkProvider],
        consumers: &[LinkConsumer],
    ) -> ResolveResult<ResolvedLinks> {
        let bindings = self.bindings(deployment, providers, consumers)?;

        self.store.replace_link_providers(deployment, providers)?;
        self.store.replace_link_consumers(deployment, consumers)?;

        let live: BTreeSet<String> = consumers.iter().map(LinkConsumer::table_key).collect();
        for stale in self.store.list_links(deployment)? {
            if !live.contains(&stale.consumer) {
                self.store.delete_links_for_consumer(&stale.consumer)?;
            }
        }

        let mut written = 0;
        for (consumer, binding) in consumers.iter().zip(&bindings) {
            let key = consumer.table_key();
            let Some(binding) = binding else {
                self.store.delete_links_for_consumer(&key)?;
                continue;
            };
            let unchanged = self
                .store
                .get_link(&key, &binding.source)?
                .is_some_and(|existing| existing.content == binding.content);
            if unchanged {
                continue;
            }
            self.store.delete_links_for_consumer(&key)?;
            self.store.put_link(&Link {
                consumer: key,
                source: binding.source.clone(),
                name: consumer.original_name.clone(),
                content: binding.content.clone(),
                created_at: epoch_ms(),
            })?;
            written += 1;
        }
        info!(deployment = %deployment, consumers = consumers.len(), written, "links bound");
        self.stored(consumers)
    }

    /// Content last bound for `consumers`, from the link rows. Consumers
    /// without a row are absent.
    pub fn stored(&self, consumers: &[LinkConsumer]) -> ResolveResult<ResolvedLinks> {
        let mut resolved = ResolvedLinks::default();
        for consumer in consumers {
            for link in self.store.list_links_for_consumer(&consumer.table_key())? {
                resolved
                    .by_job
                    .entry((consumer.instance_group.clone(), consumer.job.clone()))
                    .or_default()
                    .insert(link.name, link.content);
            }
        }
        Ok(resolved)
    }

    fn bindings(
        &self,
        deployment: &str,
        providers: &[LinkProvider],
        consumers: &[LinkConsumer],
    ) -> ResolveResult<Vec<Option<Binding>>> {
        // This deployment's providers come from the new manifest; everyone
        // else's from what they last deployed.
        let mut pool: Vec<LinkProvider> = self
            .store
            .list_link_providers(None)?
            .into_iter()
            .filter(|p| p.deployment != deployment)
            .collect();
        pool.extend(providers.iter().cloned());

        let mut failures = Vec::new();
        let mut bindings = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            match resolve_one(consumer, &pool) {
                Ok(binding) => bindings.push(binding),
                Err(failure) => {
                    failures.push(failure);
                    bindings.push(None);
                }
            }
        }
        if !failures.is_empty() {
            return Err(ResolveError::Links(failures));
        }
        Ok(bindings)
    }
}

fn collect(consumers: &[LinkConsumer], bindings: &[Option<Binding>]) -> ResolvedLinks {
    let mut resolved = ResolvedLinks::default();
    for (consumer, binding) in consumers.iter().zip(bindings) {
        if let Some(binding) = binding {
            resolved
                .by_job
                .entry((consumer.instance_group.clone(), consumer.job.clone()))
                .or_default()
                .insert(consumer.original_name.clone(), binding.content.clone());
        }
    }
    resolved
}

fn resolve_one(consumer: &LinkConsumer, pool: &[LinkProvider]) -> Result<Option<Binding>, LinkFailure> {
    if consumer.blocked {
        return Ok(None);
    }
    if let Some(content) = &consumer.manual_content {
        return Ok(Some(Binding {
            source: Link::MANUAL_SOURCE.to_string(),
            content: content.clone(),
        }));
    }

    let target = consumer.provider_deployment.as_deref().unwrap_or(&consumer.deployment);
    let visible: Vec<&LinkProvider> = pool
        .iter()
        .filter(|p| p.consumable && p.deployment == target)
        .filter(|p| p.deployment == consumer.deployment || p.shared)
        .collect();

    let matches: Vec<&LinkProvider> = match &consumer.from {
        Some(alias) => {
            let named: Vec<&LinkProvider> = visible.iter().copied().filter(|p| &p.name == alias).collect();
            let typed: Vec<&LinkProvider> = named
                .iter()
                .copied()
                .filter(|p| p.link_type == consumer.link_type)
                .collect();
            if typed.is_empty() && !named.is_empty() {
                return Err(failure(
                    consumer,
                    LinkFailureKind::TypeMismatch,
                    &format!(
                        "Link provider '{alias}' has type '{}', expected '{}'",
                        named[0].link_type, consumer.link_type
                    ),
                ));
            }
            typed
        }
        None => {
            let typed: Vec<&LinkProvider> = visible
                .iter()
                .copied()
                .filter(|p| p.link_type == consumer.link_type)
                .collect();
            let by_name: Vec<&LinkProvider> = typed
                .iter()
                .copied()
                .filter(|p| p.name == consumer.original_name)
                .collect();
            if typed.len() > 1 && by_name.len() == 1 { by_name } else { typed }
        }
    };

    match matches.as_slice() {
        [provider] => {
            debug!(
                consumer = %consumer.table_key(),
                provider = %provider.table_key(),
                "link resolved"
            );
            Ok(Some(Binding {
                source: provider.table_key(),
                content: provider.content.clone(),
            }))
        }
        [] if consumer.optional => Ok(None),
        [] => Err(failure(consumer, LinkFailureKind::Missing, "No link providers found")),
        many => {
            let listed: Vec<String> = many
                .iter()
                .map(|p| {
                    format!(
                        "    - Link provider '{}' with alias '{}' from job '{}' in instance group '{}' in deployment '{}'",
                        p.original_name, p.name, p.job, p.instance_group, p.deployment
                    )
                })
                .collect();
            Err(failure(
                consumer,
                LinkFailureKind::Ambiguous,
                &format!("Multiple link providers found:\n{}", listed.join("\n")),
            ))
        }
    }
}

fn failure(consumer: &LinkConsumer, kind: LinkFailureKind, detail: &str) -> LinkFailure {
    LinkFailure {
        kind,
        message: format!(
            "Failed to resolve link '{}' with type '{}' from job '{}' in instance group '{}'. Details below:\n  - {}",
            consumer.original_name, consumer.link_type, consumer.job, consumer.instance_group, detail
        ),
    }
}

/// Release job definitions referenced by a manifest, for callers that
/// need to check a job exists.
pub fn release_job<'a>(releases: &'a [ReleaseVersion], release: &str, job: &str) -> Option<&'a ReleaseJob> {
    releases.iter().find(|r| r.name == release).and_then(|r| r.job(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_state::ReleaseLinkDef;

    fn release() -> ReleaseVersion {
        ReleaseVersion {
            name: "app".into(),
            version: "1".into(),
            jobs: vec![
                ReleaseJob {
                    name: "postgres".into(),
                    provides: vec![ReleaseLinkDef {
                        name: "db".into(),
                        link_type: "database".into(),
                        optional: false,
                        properties: vec!["port".into(), "tls.enabled".into()],
                    }],
                    consumes: vec![],
                    properties: serde_json::from_value(json!({
                        "port": {"default": 5432},
                        "tls.enabled": {"default": false}
                    }))
                    .unwrap(),
                },
                ReleaseJob {
                    name: "api".into(),
                    provides: vec![],
                    consumes: vec![
                        ReleaseLinkDef {
                            name: "db".into(),
                            link_type: "database".into(),
                            optional: false,
                            properties: vec![],
                        },
                        ReleaseLinkDef {
                            name: "cache".into(),
                            link_type: "redis".into(),
                            optional: true,
                            properties: vec![],
                        },
                    ],
                    properties: Map::new(),
                },
            ],
            uploaded_at: 0,
        }
    }

    fn manifest(yaml: &str) -> DeploymentManifest {
        DeploymentManifest::from_yaml(yaml).unwrap().0
    }

    const TWO_GROUPS: &str = r#"
name: shop
releases: [{name: app, version: "1"}]
instance_groups:
- name: db
  instances: 1
  networks: [{name: private}]
  jobs:
  - name: postgres
    release: app
    properties: {port: 6432}
- name: web
  instances: 2
  networks: [{name: private}]
  jobs:
  - name: api
    release: app
"#;

    fn addresses() -> BTreeMap<String, Vec<InstanceAddress>> {
        let mut map = BTreeMap::new();
        map.insert(
            "db".to_string(),
            vec![InstanceAddress {
                name: "db".into(),
                index: 0,
                id: "uuid-db-0".into(),
                az: Some("z1".into()),
                address: "uuid-db-0.db.private.shop.bosh".into(),
                bootstrap: true,
            }],
        );
        map
    }

    #[test]
    fn provider_content_exports_declared_properties_with_defaults() {
        let (providers, consumers) = collect_intents(&manifest(TWO_GROUPS), &[release()], &addresses());
        assert_eq!(providers.len(), 1);
        let content = &providers[0].content;
        assert_eq!(content["properties"], json!({"port": 6432, "tls": {"enabled": false}}));
        assert_eq!(content["instances"][0]["id"], "uuid-db-0");
        assert_eq!(content["default_network"], "private");
        assert_eq!(consumers.len(), 2);
        assert!(consumers.iter().any(|c| c.original_name == "cache" && c.optional));
    }

    #[test]
    fn same_deployment_links_resolve_by_type_and_optional_ones_may_be_absent() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store.clone());
        let (providers, consumers) = collect_intents(&manifest(TWO_GROUPS), &[release()], &addresses());

        let links = resolver.bind("shop", &providers, &consumers).unwrap();
        let api = links.for_job("web", "api");
        assert_eq!(api["db"]["properties"]["port"], 6432);
        assert!(!api.contains_key("cache"));

        let rows = store.list_links("shop").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source, "shop/db/postgres/db");

        // Rebinding unchanged topology keeps the cached row.
        resolver.bind("shop", &providers, &consumers).unwrap();
        assert_eq!(store.list_links("shop").unwrap()[0].created_at, rows[0].created_at);
    }

    #[test]
    fn bound_content_is_served_from_link_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store.clone());
        let (providers, consumers) = collect_intents(&manifest(TWO_GROUPS), &[release()], &addresses());
        let links = resolver.bind("shop", &providers, &consumers).unwrap();
        assert_eq!(resolver.stored(&consumers).unwrap(), links);
        assert_eq!(resolver.resolve("shop", &providers, &consumers).unwrap(), links);

        let db = consumers.iter().find(|c| c.original_name == "db").unwrap();
        let rows = store.list_links_for_consumer(&db.table_key()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(links.for_job("web", "api")["db"], rows[0].content);

        // A consumer dropped from the manifest loses its row and its content.
        let remaining: Vec<LinkConsumer> = consumers.iter().filter(|c| c.original_name != "db").cloned().collect();
        resolver.bind("shop", &providers, &remaining).unwrap();
        assert!(store.list_links_for_consumer(&db.table_key()).unwrap().is_empty());
        assert!(!resolver.stored(&consumers).unwrap().for_job("web", "api").contains_key("db"));
    }

    #[test]
    fn missing_required_provider_fails_without_writing() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store.clone());
        let yaml = r#"
name: lonely
releases: [{name: app, version: "1"}]
instance_groups:
- name: web
  instances: 1
  jobs: [{name: api, release: app}]
"#;
        let (providers, consumers) = collect_intents(&manifest(yaml), &[release()], &BTreeMap::new());
        let err = resolver.bind("lonely", &providers, &consumers).unwrap_err();
        let ResolveError::Links(failures) = &err else { panic!("unexpected error {err}") };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, LinkFailureKind::Missing);
        assert!(err.to_string().contains("Failed to resolve link 'db' with type 'database' from job 'api'"));
        assert!(store.list_link_consumers("lonely").unwrap().is_empty());

        let director: director_core::DirectorError = err.into();
        assert_eq!(director.code(), director_core::codes::JOB_MISSING_LINK);
    }

    #[test]
    fn two_providers_of_one_type_are_ambiguous_unless_aliased() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store);
        let yaml = r#"
name: shop
releases: [{name: app, version: "1"}]
instance_groups:
- name: primary
  instances: 1
  jobs: [{name: postgres, release: app, provides: {db: {as: primary_db}}}]
- name: replica
  instances: 1
  jobs: [{name: postgres, release: app, provides: {db: {as: replica_db}}}]
- name: web
  instances: 1
  jobs: [{name: api, release: app}]
"#;
        let (providers, consumers) = collect_intents(&manifest(yaml), &[release()], &BTreeMap::new());
        let err = resolver.resolve("shop", &providers, &consumers).unwrap_err();
        assert!(matches!(&err, ResolveError::Links(f) if f[0].kind == LinkFailureKind::Ambiguous));
        assert!(err.to_string().contains("Multiple link providers found"));

        let aliased = yaml.replace(
            "jobs: [{name: api, release: app}]",
            "jobs: [{name: api, release: app, consumes: {db: {from: replica_db}}}]",
        );
        let (providers, consumers) = collect_intents(&manifest(&aliased), &[release()], &BTreeMap::new());
        let links = resolver.resolve("shop", &providers, &consumers).unwrap();
        assert_eq!(links.for_job("web", "api")["db"]["instance_group"], "replica");
    }

    #[test]
    fn cross_deployment_links_need_shared_providers() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store.clone());
        let provider_yaml = r#"
name: data
releases: [{name: app, version: "1"}]
instance_groups:
- name: db
  instances: 1
  jobs: [{name: postgres, release: app, provides: {db: {as: shared_db, shared: true}}}]
"#;
        let (providers, consumers) = collect_intents(&manifest(provider_yaml), &[release()], &BTreeMap::new());
        resolver.bind("data", &providers, &consumers).unwrap();

        let consumer_yaml = r#"
name: shop
releases: [{name: app, version: "1"}]
instance_groups:
- name: web
  instances: 1
  jobs: [{name: api, release: app, consumes: {db: {from: shared_db, deployment: data}}}]
"#;
        let (providers, consumers) = collect_intents(&manifest(consumer_yaml), &[release()], &BTreeMap::new());
        let links = resolver.bind("shop", &providers, &consumers).unwrap();
        assert_eq!(links.for_job("web", "api")["db"]["deployment_name"], "data");

        // Unshare the provider: the consumer no longer sees it.
        let private = provider_yaml.replace("shared: true", "shared: false");
        let (p, c) = collect_intents(&manifest(&private), &[release()], &BTreeMap::new());
        resolver.bind("data", &p, &c).unwrap();
        assert!(resolver.resolve("shop", &providers, &consumers).is_err());
    }

    #[test]
    fn manual_and_blocked_consumers() {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = LinkResolver::new(store.clone());
        let yaml = r#"
name: shop
releases: [{name: app, version: "1"}]
instance_groups:
- name: web
  instances: 1
  jobs:
  - name: api
    release: app
    consumes:
      db: {address: db.example.com, properties: {port: 5432}}
      cache: ~
"#;
        let (providers, consumers) = collect_intents(&manifest(yaml), &[release()], &BTreeMap::new());
        assert!(consumers.iter().any(|c| c.original_name == "cache" && c.blocked));
        let links = resolver.bind("shop", &providers, &consumers).unwrap();
        let api = links.for_job("web", "api");
        assert_eq!(api["db"]["address"], "db.example.com");
        assert_eq!(api["db"]["deployment_name"], "shop");
        assert_eq!(store.list_links("shop").unwrap()[0].source, Link::MANUAL_SOURCE);
    }
}
