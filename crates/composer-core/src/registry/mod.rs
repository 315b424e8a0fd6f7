//! Merged namespace of tools, prompts and resources across live servers.
//!
//! A refresh re-derives the whole namespace from the capability sets of the
//! currently running servers (in registration order), resolves collisions
//! with the configured strategy, and swaps the result in atomically. Readers
//! always see one complete namespace, old or new.

mod policy;
mod resolve;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ComposerError, Result};
use crate::observer::{ComposerEvent, EventSink};
use crate::protocol::{PromptInfo, ResourceInfo, ToolInfo};

pub use policy::{AliasEntry, ConflictStrategy, RegistryPolicy, StrategyOverride, VersioningSettings};

use policy::CompiledPolicy;
use resolve::{Candidate, resolve, versioned_name};

/// Which namespace a descriptor lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Tool => f.write_str("tool"),
            CapabilityKind::Prompt => f.write_str("prompt"),
            CapabilityKind::Resource => f.write_str("resource"),
        }
    }
}

/// A tool, prompt or resource as exposed by the composer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Name after conflict resolution.
    pub exposed_name: String,
    pub kind: CapabilityKind,
    pub origin_server: String,
    /// Name the origin server registered.
    pub origin_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema (tools) or argument list (prompts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Descriptor of a tool.
pub type ToolDescriptor = CapabilityDescriptor;

impl CapabilityDescriptor {
    fn from_tool(server: &str, version: Option<&str>, tool: &ToolInfo) -> Self {
        Self {
            exposed_name: tool.name.clone(),
            kind: CapabilityKind::Tool,
            origin_server: server.to_string(),
            origin_name: tool.name.clone(),
            description: tool.description.clone(),
            schema: tool.input_schema.clone(),
            version: version.map(str::to_string),
            aliases: Vec::new(),
            uri: None,
            mime_type: None,
        }
    }

    fn from_prompt(server: &str, version: Option<&str>, prompt: &PromptInfo) -> Self {
        Self {
            exposed_name: prompt.name.clone(),
            kind: CapabilityKind::Prompt,
            origin_server: server.to_string(),
            origin_name: prompt.name.clone(),
            description: prompt.description.clone(),
            schema: prompt.arguments.clone(),
            version: version.map(str::to_string),
            aliases: Vec::new(),
            uri: None,
            mime_type: None,
        }
    }

    fn from_resource(server: &str, version: Option<&str>, resource: &ResourceInfo) -> Self {
        Self {
            exposed_name: resource.name.clone(),
            kind: CapabilityKind::Resource,
            origin_server: server.to_string(),
            origin_name: resource.name.clone(),
            description: resource.description.clone(),
            schema: None,
            version: version.map(str::to_string),
            aliases: Vec::new(),
            uri: Some(resource.uri.clone()),
            mime_type: resource.mime_type.clone(),
        }
    }

    pub fn route(&self) -> Route {
        Route {
            server: self.origin_server.clone(),
            origin_name: self.origin_name.clone(),
            exposed_name: self.exposed_name.clone(),
        }
    }

    /// The tool as advertised to clients of the aggregate.
    pub fn to_tool_info(&self) -> ToolInfo {
        ToolInfo {
            name: self.exposed_name.clone(),
            description: self.description.clone(),
            input_schema: self.schema.clone(),
        }
    }

    pub fn to_prompt_info(&self) -> PromptInfo {
        PromptInfo {
            name: self.exposed_name.clone(),
            description: self.description.clone(),
            arguments: self.schema.clone(),
        }
    }

    pub fn to_resource_info(&self) -> ResourceInfo {
        ResourceInfo {
            uri: self.uri.clone().unwrap_or_default(),
            name: self.exposed_name.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Capabilities one running server advertised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    /// Effective version tag (configured, else reported in `initialize`).
    pub version: Option<String>,
    pub tools: Vec<ToolInfo>,
    pub prompts: Vec<PromptInfo>,
    pub resources: Vec<ResourceInfo>,
}

/// Where an exposed name is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub server: String,
    pub origin_name: String,
    pub exposed_name: String,
}

/// Result of a name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteLookup {
    /// In the current namespace.
    Live(Route),
    /// Dropped because its origin server is registered but no longer running.
    Retired(Route),
}

/// One collision and how it was decided. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub kind: CapabilityKind,
    pub origin_name: String,
    /// Colliding servers in registration order.
    pub servers: Vec<String>,
    pub strategy: String,
    /// Resulting exposed names; empty when the strategy refused.
    pub exposed: Vec<String>,
    pub rejected: bool,
    pub at: DateTime<Utc>,
}

impl ConflictRecord {
    fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.kind,
            self.origin_name,
            self.servers.join(","),
            self.strategy
        )
    }
}

/// Counts after a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
    /// Whether the namespace differs from the previous one.
    pub changed: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct KindTable {
    entries: Vec<CapabilityDescriptor>,
    index: HashMap<String, usize>,
}

impl KindTable {
    fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    fn insert(&mut self, descriptor: CapabilityDescriptor) -> std::result::Result<(), &CapabilityDescriptor> {
        if let Some(&existing) = self.index.get(&descriptor.exposed_name) {
            return Err(&self.entries[existing]);
        }
        self.index
            .insert(descriptor.exposed_name.clone(), self.entries.len());
        self.entries.push(descriptor);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Namespace {
    tools: KindTable,
    prompts: KindTable,
    resources: KindTable,
    resource_uris: HashMap<String, usize>,
    /// Routes of entries whose server is registered but not running,
    /// keyed by kind and name (URI for resources).
    retired: HashMap<(CapabilityKind, String), Route>,
}

impl Namespace {
    fn table(&self, kind: CapabilityKind) -> &KindTable {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Prompt => &self.prompts,
            CapabilityKind::Resource => &self.resources,
        }
    }

    fn table_mut(&mut self, kind: CapabilityKind) -> &mut KindTable {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Prompt => &mut self.prompts,
            CapabilityKind::Resource => &mut self.resources,
        }
    }

    fn retirement_key(descriptor: &CapabilityDescriptor) -> (CapabilityKind, String) {
        match (&descriptor.kind, &descriptor.uri) {
            (CapabilityKind::Resource, Some(uri)) => (CapabilityKind::Resource, uri.clone()),
            (kind, _) => (*kind, descriptor.exposed_name.clone()),
        }
    }

    fn live_keys(&self) -> HashSet<(CapabilityKind, String)> {
        [&self.tools, &self.prompts, &self.resources]
            .into_iter()
            .flat_map(|table| table.entries.iter().map(Self::retirement_key))
            .collect()
    }
}

/// The tool registry and conflict resolver.
pub struct Registry {
    policy: CompiledPolicy,
    namespace: RwLock<Arc<Namespace>>,
    aliases: RwLock<Vec<AliasEntry>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
    seen: Mutex<HashSet<String>>,
    events: EventSink,
}

impl Registry {
    /// Compile `policy` and register its static aliases.
    pub fn new(policy: &RegistryPolicy, events: EventSink) -> Result<Self> {
        let registry = Self {
            policy: policy.compile()?,
            namespace: RwLock::new(Arc::new(Namespace::default())),
            aliases: RwLock::new(Vec::new()),
            conflicts: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            events,
        };
        for alias in &policy.aliases {
            registry.add_alias(&alias.alias, &alias.target)?;
        }
        Ok(registry)
    }

    fn snapshot(&self) -> Arc<Namespace> {
        Arc::clone(&self.namespace.read())
    }

    /// Rebuild the namespace from the servers in `live` (registration order).
    ///
    /// `registered` names every server still known to the supervisor; entries
    /// of those that are not live are kept as retired routes. On a conflict
    /// the current namespace is left untouched.
    pub fn refresh(
        &self,
        live: &[(String, Arc<CapabilitySet>)],
        registered: &HashSet<String>,
    ) -> Result<RefreshSummary> {
        let mut decisions = Vec::new();
        let built = self.build(live, &mut decisions);
        self.record(decisions);
        let mut namespace = built?;

        let previous = self.snapshot();
        let live_keys = namespace.live_keys();
        let previous_routes = [&previous.tools, &previous.prompts, &previous.resources]
            .into_iter()
            .flat_map(|table| {
                table
                    .entries
                    .iter()
                    .map(|d| (Namespace::retirement_key(d), d.route()))
            })
            .chain(previous.retired.iter().map(|(k, r)| (k.clone(), r.clone())));
        for (key, route) in previous_routes {
            if !live_keys.contains(&key) && registered.contains(&route.server) {
                namespace.retired.entry(key).or_insert(route);
            }
        }

        let summary = RefreshSummary {
            tools: namespace.tools.entries.len(),
            prompts: namespace.prompts.entries.len(),
            resources: namespace.resources.entries.len(),
            changed: namespace.tools != previous.tools
                || namespace.prompts != previous.prompts
                || namespace.resources != previous.resources,
        };

        *self.namespace.write() = Arc::new(namespace);
        debug!(
            tools = summary.tools,
            prompts = summary.prompts,
            resources = summary.resources,
            changed = summary.changed,
            "Registry refreshed"
        );
        Ok(summary)
    }

    fn build(
        &self,
        live: &[(String, Arc<CapabilitySet>)],
        decisions: &mut Vec<ConflictRecord>,
    ) -> Result<Namespace> {
        let mut namespace = Namespace::default();

        let tools: Vec<Vec<CapabilityDescriptor>> = live
            .iter()
            .map(|(server, set)| {
                set.tools
                    .iter()
                    .map(|t| CapabilityDescriptor::from_tool(server, set.version.as_deref(), t))
                    .collect()
            })
            .collect();
        self.merge(CapabilityKind::Tool, tools, &mut namespace, decisions)?;

        let prompts: Vec<Vec<CapabilityDescriptor>> = live
            .iter()
            .map(|(server, set)| {
                set.prompts
                    .iter()
                    .map(|p| CapabilityDescriptor::from_prompt(server, set.version.as_deref(), p))
                    .collect()
            })
            .collect();
        self.merge(CapabilityKind::Prompt, prompts, &mut namespace, decisions)?;

        let resources: Vec<Vec<CapabilityDescriptor>> = live
            .iter()
            .map(|(server, set)| {
                set.resources
                    .iter()
                    .map(|r| CapabilityDescriptor::from_resource(server, set.version.as_deref(), r))
                    .collect()
            })
            .collect();
        self.merge(CapabilityKind::Resource, resources, &mut namespace, decisions)?;

        let uris: Vec<(String, usize)> = namespace
            .resources
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.uri.clone().map(|uri| (uri, i)))
            .collect();
        for (uri, i) in uris {
            namespace.resource_uris.entry(uri).or_insert(i);
        }

        Ok(namespace)
    }

    fn merge(
        &self,
        kind: CapabilityKind,
        per_server: Vec<Vec<CapabilityDescriptor>>,
        namespace: &mut Namespace,
        decisions: &mut Vec<ConflictRecord>,
    ) -> Result<()> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<CapabilityDescriptor>> = HashMap::new();
        for descriptors in per_server {
            let mut local_names = HashSet::new();
            for descriptor in descriptors {
                if !local_names.insert(descriptor.origin_name.clone()) {
                    warn!(
                        server = %descriptor.origin_server,
                        kind = %kind,
                        name = %descriptor.origin_name,
                        "Server advertises the same name twice; keeping the first"
                    );
                    continue;
                }
                groups
                    .entry(descriptor.origin_name.clone())
                    .or_insert_with(|| {
                        order.push(descriptor.origin_name.clone());
                        Vec::new()
                    })
                    .push(descriptor);
            }
        }

        let table = namespace.table_mut(kind);
        for local in order {
            let Some(group) = groups.remove(&local) else {
                continue;
            };

            if group.len() == 1 {
                for descriptor in group {
                    place(table, descriptor, "none")?;
                }
                continue;
            }

            let servers: Vec<String> = group.iter().map(|d| d.origin_server.clone()).collect();
            let (placements, label) = match self.versioned(&local, &group) {
                Some(placements) => (placements, "versioned".to_string()),
                None => {
                    let strategy = self.policy.strategy_for(&local);
                    let candidates: Vec<Candidate<'_>> = group
                        .iter()
                        .map(|d| Candidate {
                            server: &d.origin_server,
                            version: d.version.as_deref(),
                        })
                        .collect();
                    match resolve(strategy, &local, &candidates) {
                        Some(placements) => (placements, strategy.to_string()),
                        None => {
                            decisions.push(ConflictRecord {
                                kind,
                                origin_name: local.clone(),
                                servers: servers.clone(),
                                strategy: strategy.to_string(),
                                exposed: Vec::new(),
                                rejected: true,
                                at: Utc::now(),
                            });
                            return Err(ComposerError::ToolConflict {
                                name: local,
                                servers,
                                strategy: strategy.to_string(),
                            });
                        }
                    }
                }
            };

            decisions.push(ConflictRecord {
                kind,
                origin_name: local.clone(),
                servers: servers.clone(),
                strategy: label.clone(),
                exposed: placements.iter().map(|(_, name)| name.clone()).collect(),
                rejected: false,
                at: Utc::now(),
            });

            for (i, descriptor) in group.iter().enumerate() {
                if !placements.iter().any(|(kept, _)| *kept == i) {
                    info!(
                        kind = %kind,
                        name = %local,
                        server = %descriptor.origin_server,
                        strategy = %label,
                        "Dropping colliding entry"
                    );
                }
            }
            for (i, exposed) in placements {
                let mut descriptor = group[i].clone();
                descriptor.exposed_name = exposed;
                place(table, descriptor, &label)?;
            }
        }
        Ok(())
    }

    /// Version-suffixed names when every colliding entry has a distinct tag.
    fn versioned(&self, local: &str, group: &[CapabilityDescriptor]) -> Option<Vec<(usize, String)>> {
        let versioning = &self.policy.versioning;
        if !versioning.enabled {
            return None;
        }
        let versions: Vec<&str> = group.iter().map(|d| d.version.as_deref()).collect::<Option<_>>()?;
        let distinct: HashSet<&str> = versions.iter().copied().collect();
        if distinct.len() != versions.len() {
            return None;
        }
        Some(
            versions
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i, versioned_name(&versioning.suffix_format, local, v)))
                .collect(),
        )
    }

    /// Append records not seen before and announce them.
    fn record(&self, decisions: Vec<ConflictRecord>) {
        if decisions.is_empty() {
            return;
        }
        let mut seen = self.seen.lock();
        let mut conflicts = self.conflicts.lock();
        for record in decisions {
            if seen.insert(record.fingerprint()) {
                info!(
                    kind = %record.kind,
                    name = %record.origin_name,
                    servers = ?record.servers,
                    strategy = %record.strategy,
                    exposed = ?record.exposed,
                    "Recorded name conflict"
                );
                self.events.emit(ComposerEvent::ConflictResolved(record.clone()));
                conflicts.push(record);
            }
        }
    }

    /// All descriptors of `kind`, in namespace order, with their aliases.
    pub fn list(&self, kind: CapabilityKind) -> Vec<CapabilityDescriptor> {
        let namespace = self.snapshot();
        let aliases = self.aliases.read();
        namespace
            .table(kind)
            .entries
            .iter()
            .cloned()
            .map(|d| attach_aliases(d, &aliases))
            .collect()
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.list(CapabilityKind::Tool)
    }

    /// Look up by exposed name, or by alias for tools.
    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<CapabilityDescriptor> {
        let namespace = self.snapshot();
        let aliases = self.aliases.read();
        let table = namespace.table(kind);
        table
            .get(name)
            .or_else(|| match kind {
                CapabilityKind::Tool => alias_target(&aliases, name).and_then(|t| table.get(t)),
                _ => None,
            })
            .cloned()
            .map(|d| attach_aliases(d, &aliases))
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.get(CapabilityKind::Tool, name)
    }

    /// Route a name (or tool alias) to its origin.
    pub fn lookup(&self, kind: CapabilityKind, name: &str) -> Option<RouteLookup> {
        let namespace = self.snapshot();
        let aliases = self.aliases.read();
        let target = match kind {
            CapabilityKind::Tool if namespace.tools.get(name).is_none() => {
                alias_target(&aliases, name).unwrap_or(name)
            }
            _ => name,
        };

        if let Some(descriptor) = namespace.table(kind).get(target) {
            return Some(RouteLookup::Live(descriptor.route()));
        }
        namespace
            .retired
            .get(&(kind, target.to_string()))
            .cloned()
            .map(RouteLookup::Retired)
    }

    /// Route a resource URI to its origin.
    pub fn lookup_resource(&self, uri: &str) -> Option<RouteLookup> {
        let namespace = self.snapshot();
        if let Some(&i) = namespace.resource_uris.get(uri) {
            return Some(RouteLookup::Live(namespace.resources.entries[i].route()));
        }
        namespace
            .retired
            .get(&(CapabilityKind::Resource, uri.to_string()))
            .cloned()
            .map(RouteLookup::Retired)
    }

    /// Every exposed tool whose origin name is `local` and that carries a version.
    pub fn versions_of(&self, local: &str) -> Vec<ToolDescriptor> {
        self.list_tools()
            .into_iter()
            .filter(|d| d.origin_name == local && d.version.is_some())
            .collect()
    }

    /// Register `alias` for the exposed tool `target`.
    ///
    /// A colliding alias is decided by the strategy that applies to the alias
    /// name. Returns the alias actually registered.
    pub fn add_alias(&self, alias: &str, target: &str) -> Result<String> {
        if alias.trim().is_empty() || target.trim().is_empty() {
            return Err(ComposerError::config("alias and target must not be empty"));
        }

        let mut aliases = self.aliases.write();
        let Some(position) = aliases.iter().position(|a| a.alias == alias) else {
            aliases.push(AliasEntry {
                alias: alias.to_string(),
                target: target.to_string(),
            });
            debug!(alias = %alias, target = %target, "Alias registered");
            return Ok(alias.to_string());
        };

        let existing = aliases[position].target.clone();
        if existing == target {
            return Ok(alias.to_string());
        }

        let strategy = self.policy.strategy_for(alias).clone();
        match strategy {
            ConflictStrategy::Error => Err(ComposerError::ToolConflict {
                name: alias.to_string(),
                servers: vec![existing, target.to_string()],
                strategy: strategy.to_string(),
            }),
            ConflictStrategy::Ignore => {
                info!(alias = %alias, kept = %existing, ignored = %target, "Alias already taken; keeping first");
                Ok(alias.to_string())
            }
            ConflictStrategy::Override => {
                info!(alias = %alias, previous = %existing, target = %target, "Alias replaced");
                aliases[position].target = target.to_string();
                Ok(alias.to_string())
            }
            ConflictStrategy::Prefix | ConflictStrategy::Suffix | ConflictStrategy::Custom { .. } => {
                let server = self
                    .snapshot()
                    .tools
                    .get(target)
                    .map(|d| d.origin_server.clone())
                    .unwrap_or_else(|| target.to_string());
                let renamed = resolve(
                    &strategy,
                    alias,
                    &[Candidate {
                        server: &server,
                        version: None,
                    }],
                )
                .and_then(|placements| placements.into_iter().next())
                .map(|(_, name)| name)
                .unwrap_or_else(|| format!("{}_{}", server, alias));

                if aliases.iter().any(|a| a.alias == renamed) {
                    return Err(ComposerError::ToolConflict {
                        name: renamed,
                        servers: vec![existing, target.to_string()],
                        strategy: strategy.to_string(),
                    });
                }
                info!(alias = %alias, renamed = %renamed, target = %target, "Alias collision renamed");
                aliases.push(AliasEntry {
                    alias: renamed.clone(),
                    target: target.to_string(),
                });
                Ok(renamed)
            }
        }
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        let mut aliases = self.aliases.write();
        let before = aliases.len();
        aliases.retain(|a| a.alias != alias);
        aliases.len() != before
    }

    pub fn aliases(&self) -> Vec<AliasEntry> {
        self.aliases.read().clone()
    }

    /// Conflict history, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().clone()
    }
}

fn place(table: &mut KindTable, descriptor: CapabilityDescriptor, strategy: &str) -> Result<()> {
    let origin = descriptor.origin_server.clone();
    table.insert(descriptor).map_err(|existing| ComposerError::ToolConflict {
        name: existing.exposed_name.clone(),
        servers: vec![existing.origin_server.clone(), origin],
        strategy: strategy.to_string(),
    })
}

fn alias_target<'a>(aliases: &'a [AliasEntry], name: &str) -> Option<&'a str> {
    aliases
        .iter()
        .find(|a| a.alias == name)
        .map(|a| a.target.as_str())
}

fn attach_aliases(mut descriptor: CapabilityDescriptor, aliases: &[AliasEntry]) -> CapabilityDescriptor {
    if descriptor.kind == CapabilityKind::Tool {
        descriptor.aliases = aliases
            .iter()
            .filter(|a| a.target == descriptor.exposed_name)
            .map(|a| a.alias.clone())
            .collect();
    }
    descriptor
}
