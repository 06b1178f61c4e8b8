pub mod backends;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::filters::{FieldsFilter, SourceFilter};
use crate::pattern::{FilterString, Pattern};
use crate::role::{
    IndexNode, PermissionSet, RestrictedScope, Restriction, Role, RoleRestrictions, TypeNode,
};
use backends::{AuthenticationBackend, GroupBackend, RoleBackend};

/// Reverse DNS lookups during authentication must not stall the request
const NAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

const ROLE_CACHE_SIZE: usize = 256;

/// Raised by `create_filter_string` when the caller expects a single
/// include but the client's roles provide several; the caller reports the
/// candidates so the client can pick one.
#[derive(Error, Debug)]
#[error("Multiple includes found")]
pub struct MultipleIncludesError {
    pub includes: Vec<String>,
}

impl MultipleIncludesError {
    fn new<'a>(includes: impl IntoIterator<Item = &'a Pattern>) -> Self {
        Self {
            includes: includes.into_iter().map(|p| p.text().to_string()).collect(),
        }
    }
}

/// Result of collecting the filters granting a permission in some context
#[derive(Debug, PartialEq)]
pub enum CollectResult {
    /// No role grants access in the given context
    Deny,
    /// Some role grants the permission without any restriction
    Unrestricted,
    /// The broadest includes that grant access, with their excludes
    Filters(Vec<(Pattern, Vec<Pattern>)>),
}

/// A client sending requests over one connection.
///
/// Created per connection, authenticated once, populated with groups and
/// roles once, then consulted by every handler dispatched on the
/// connection. Roles are immutable snapshots taken at populate time.
#[derive(Debug, Clone)]
pub struct Client {
    pub address: IpAddr,
    pub port: u16,
    pub peer_address: Option<IpAddr>,
    pub peer_port: Option<u16>,
    pub name: Option<String>,
    pub authenticated: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_role: Option<String>,
    pub groups: Option<Vec<String>>,
    roles: Vec<Role>,
    restricted_scope: Option<RestrictedScope>,
}

impl Client {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            peer_address: None,
            peer_port: None,
            name: None,
            authenticated: false,
            username: None,
            password: None,
            default_role: None,
            groups: None,
            roles: Vec::new(),
            restricted_scope: None,
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Install the role snapshot and recompute the restricted scope
    pub fn set_roles(&mut self, roles: Vec<Role>) {
        self.roles = roles;
        self.recompute_scope();
    }

    fn recompute_scope(&mut self) {
        self.restricted_scope = self
            .roles
            .iter()
            .filter_map(Role::get_restricted_scope)
            .max();
    }

    /// The narrowest scope at which any of this client's roles restricts it
    pub fn restricted_scope(&self) -> Option<RestrictedScope> {
        self.restricted_scope
    }

    /// Whether this client is restricted within the given scope
    pub fn is_restricted(&self, scope: RestrictedScope) -> bool {
        match scope {
            RestrictedScope::Fields => self.restricted_scope == Some(RestrictedScope::Fields),
            RestrictedScope::Types => {
                matches!(
                    self.restricted_scope,
                    Some(RestrictedScope::Types) | Some(RestrictedScope::Fields)
                )
            }
            RestrictedScope::Indices => self.restricted_scope.is_some(),
        }
    }

    /// Whether any role grants the permission in the given context
    pub fn can(
        &self,
        permission: &str,
        index: Option<&Pattern>,
        document_type: Option<&Pattern>,
        field: Option<&Pattern>,
    ) -> bool {
        self.roles
            .iter()
            .any(|role| role.permits(permission, index, document_type, field))
    }

    /// Whether this client is restricted within the given context. With a
    /// permission, only restrictions that do not grant it count.
    pub fn has_restriction(
        &self,
        index: &FilterString,
        document_type: Option<&FilterString>,
        without_permission: Option<&str>,
    ) -> bool {
        let scope = if document_type.is_some() {
            RestrictedScope::Fields
        } else {
            RestrictedScope::Types
        };
        if !self.is_restricted(scope) {
            return false;
        }

        let index = index.base_pattern();
        let document_type = document_type.and_then(FilterString::base_pattern);
        let invert = without_permission.is_some();

        self.roles.iter().any(|role| {
            matches!(
                role.get_restrictions(
                    index.as_ref(),
                    document_type.as_ref(),
                    without_permission,
                    invert,
                ),
                RoleRestrictions::Found(found) if !found.is_empty()
            )
        })
    }

    /// Create a filter string covering what this client may access, taking
    /// the client's own request into account. Returns `None` when the
    /// client may not access anything in the given context, and an empty
    /// filter when it is not restricted at all.
    pub fn create_filter_string(
        &self,
        permission: &str,
        filter_string: Option<&FilterString>,
        index: Option<&FilterString>,
        single: bool,
    ) -> Result<Option<FilterString>, MultipleIncludesError> {
        let scope = if index.is_none() {
            RestrictedScope::Indices
        } else {
            RestrictedScope::Types
        };
        if !self.is_restricted(scope) {
            return Ok(Some(filter_string.cloned().unwrap_or_default()));
        }

        let index = index.and_then(FilterString::base_pattern);
        let filters = match self.collect_filters(permission, filter_string, index.as_ref(), None) {
            CollectResult::Deny => return Ok(None),
            CollectResult::Unrestricted => {
                return Ok(Some(filter_string.cloned().unwrap_or_default()))
            }
            CollectResult::Filters(filters) => filters,
        };

        let mut prepared = FilterString::new();
        for (include, excludes) in &filters {
            prepared.append_include(include.clone());
            for exclude in excludes {
                prepared.append_exclude(exclude.clone());
            }
        }

        match filter_string {
            Some(requested) if !requested.is_empty() => {
                // The client provides a filter of its own, adjust it
                let mut requested = requested.clone();
                if !requested.combine(&prepared) {
                    return Ok(None); // Nothing of what the client requested remained
                }

                if single && requested.combined().len() > 1 {
                    return Err(MultipleIncludesError::new(requested.combined()));
                }

                Ok(Some(requested))
            }
            _ => {
                if single && prepared.len() > 1 {
                    // It would be unsafe to guess which include to return
                    return Err(MultipleIncludesError::new(prepared.iter_patterns()));
                }

                Ok(Some(prepared))
            }
        }
    }

    /// Create a source filter covering what this client may retrieve.
    /// Returns `None` when nothing of what the client requested remains.
    pub fn create_source_filter(
        &self,
        permission: &str,
        index: &FilterString,
        document_type: &FilterString,
        source_filter: Option<SourceFilter>,
    ) -> Option<SourceFilter> {
        if !self.is_restricted(RestrictedScope::Fields) {
            return Some(source_filter.unwrap_or_default());
        }

        let index = index.base_pattern();
        let document_type = document_type.base_pattern();
        let filters = match self.collect_filters(
            permission,
            None,
            index.as_ref(),
            document_type.as_ref(),
        ) {
            CollectResult::Deny => return None,
            CollectResult::Unrestricted => return Some(source_filter.unwrap_or_default()),
            CollectResult::Filters(filters) => filters,
        };

        let mut prepared = SourceFilter::new();
        for (include, excludes) in filters {
            prepared.includes.push(include);
            for exclude in excludes {
                if !prepared.excludes.contains(&exclude) {
                    prepared.excludes.push(exclude);
                }
            }
        }

        match source_filter {
            None => Some(prepared),
            Some(requested) if requested.is_empty() => Some(prepared),
            Some(requested) if requested.discards_source() => Some(requested),
            Some(mut requested) => {
                if requested.combine(&prepared) {
                    Some(requested)
                } else {
                    None
                }
            }
        }
    }

    /// Create a stored-fields filter covering what this client may
    /// retrieve. A fields filter has no excludes, so only includes whose
    /// excludes do not interfere with the client's request are usable.
    pub fn create_fields_filter(
        &self,
        permission: &str,
        index: &FilterString,
        document_type: &FilterString,
        fields_filter: Option<FieldsFilter>,
    ) -> Option<FieldsFilter> {
        if !self.is_restricted(RestrictedScope::Fields) {
            return Some(fields_filter.unwrap_or_default());
        }
        if let Some(requested) = &fields_filter {
            if requested.is_empty() {
                // The client wants no fields, provide none either
                return Some(requested.clone());
            }
        }

        let index = index.base_pattern();
        let document_type = document_type.base_pattern();
        let filters = match self.collect_filters(
            permission,
            None,
            index.as_ref(),
            document_type.as_ref(),
        ) {
            CollectResult::Deny => return None,
            CollectResult::Unrestricted => return Some(fields_filter.unwrap_or_default()),
            CollectResult::Filters(filters) => filters,
        };

        let requested = fields_filter.unwrap_or_default();
        let usable: Vec<Pattern> = filters
            .iter()
            .filter(|(_, excludes)| {
                excludes.is_empty()
                    || !excludes
                        .iter()
                        .any(|e| requested.fields().iter().any(|p| p.matches(e)))
            })
            .map(|(include, _)| include.clone())
            .collect();

        if usable.is_empty() {
            // Every usable include has excludes the request runs into. If
            // "_source" is given and no particular stored field is, source
            // fields still work while stored fields can be pretended away.
            if requested.requires_source()
                && (requested.fields().is_empty() || requested.fields()[0].is_match_all())
            {
                return Some(FieldsFilter::source_only());
            }
            return None;
        }

        let mut requested = requested;
        if requested.combine(&FieldsFilter::new(usable)) {
            Some(requested)
        } else {
            None
        }
    }

    /// Collect the filters granting the given permission in the given
    /// context. Overlapping filters are pruned so that only those granting
    /// the broadest access remain.
    pub fn collect_filters(
        &self,
        permission: &str,
        filter_string: Option<&FilterString>,
        index: Option<&Pattern>,
        document_type: Option<&Pattern>,
    ) -> CollectResult {
        let mut filters: Vec<(Pattern, Vec<Pattern>)> = Vec::new();
        let mut involved_roles: HashMap<String, usize> = HashMap::new();
        let mut indisposed_roles = 0;

        for (role_index, role) in self.roles.iter().enumerate() {
            match role.get_restrictions(index, document_type, Some(permission), false) {
                RoleRestrictions::WithoutPermission => {
                    // The role has opinions here but grants no access
                    indisposed_roles += 1;
                }
                RoleRestrictions::Found(restrictions) if restrictions.is_empty() => {
                    if role.permits(permission, index, document_type, None) {
                        // Granted at a higher level, the client is not
                        // restricted in this context at all
                        return CollectResult::Unrestricted;
                    }
                    indisposed_roles += 1;
                }
                RoleRestrictions::Found(restrictions) => {
                    for restriction in restrictions {
                        for include in &restriction.includes {
                            involved_roles.insert(include.text().to_string(), role_index);
                            match filters.iter_mut().find(|(i, _)| i == include) {
                                Some((_, excludes)) => {
                                    excludes.extend(restriction.excludes.iter().cloned())
                                }
                                None => filters
                                    .push((include.clone(), restriction.excludes.clone())),
                            }
                        }
                    }
                }
            }
        }

        if filters.is_empty() {
            if indisposed_roles == self.roles.len() {
                return CollectResult::Deny;
            }
            return CollectResult::Filters(filters);
        }

        // Remove the most restrictive filters so the client gets the
        // broadest access its roles provide
        let scope = if index.is_none() {
            RestrictedScope::Indices
        } else if document_type.is_none() {
            RestrictedScope::Types
        } else {
            RestrictedScope::Fields
        };

        let snapshot: Vec<Pattern> = filters.iter().map(|(include, _)| include.clone()).collect();
        for include in snapshot {
            if !filters.iter().any(|(i, _)| *i == include) {
                continue;
            }

            let mut superior = include.clone();
            for (candidate, _) in &filters {
                if *candidate > superior {
                    superior = candidate.clone();
                }
            }
            if superior == include {
                continue;
            }

            let requested_within = filter_string.map_or(false, |requested| {
                !requested.is_empty()
                    && requested.iter_patterns().all(|p| include.matches(p))
            });

            if requested_within {
                // The client restricts itself to within this include
                // already; widening to the superior one could re-admit
                // patterns its excludes rule out
                filters.retain(|(i, _)| *i != superior);
                continue;
            }

            let include_scope = involved_roles
                .get(include.text())
                .and_then(|&role_index| self.roles[role_index].get_restricted_scope());
            if include_scope == Some(scope) {
                // Excludes of the superior include that this include's role
                // already permits can be exchanged for the include's own
                let superior_excludes: Vec<Pattern> = filters
                    .iter()
                    .find(|(i, _)| *i == superior)
                    .map(|(_, e)| e.clone())
                    .unwrap_or_default();
                if !superior_excludes.is_empty() {
                    let mut kept: Vec<Pattern> = superior_excludes
                        .iter()
                        .filter(|e| !e.matches(&include))
                        .cloned()
                        .collect();
                    if kept.len() != superior_excludes.len() {
                        if let Some((_, own)) = filters.iter().find(|(i, _)| *i == include) {
                            kept.extend(own.iter().cloned());
                        }
                        if let Some((_, excludes)) =
                            filters.iter_mut().find(|(i, _)| *i == superior)
                        {
                            *excludes = kept;
                        }
                    }
                }
            }

            filters.retain(|(i, _)| *i != include);
        }

        CollectResult::Filters(filters)
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            return f.write_str(name);
        }
        if let Some(username) = &self.username {
            return f.write_str(username);
        }
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Everything involved in authenticating clients and resolving their roles
pub struct AuthEngine {
    allow_from: HashMap<String, Vec<u16>>,
    trusted_proxies: HashMap<String, Vec<u16>>,
    config_index: String,
    role_backend: Arc<dyn RoleBackend>,
    auth_backends: Vec<Arc<dyn AuthenticationBackend>>,
    group_backends: Vec<Arc<dyn GroupBackend>>,
    role_cache: Mutex<LruCache<String, Arc<Vec<Role>>>>,
}

impl AuthEngine {
    pub fn new(
        allow_from: HashMap<String, Vec<u16>>,
        trusted_proxies: HashMap<String, Vec<u16>>,
        config_index: String,
        role_backend: Arc<dyn RoleBackend>,
        auth_backends: Vec<Arc<dyn AuthenticationBackend>>,
        group_backends: Vec<Arc<dyn GroupBackend>>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(ROLE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            allow_from,
            trusted_proxies,
            config_index,
            role_backend,
            auth_backends,
            group_backends,
            role_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Authenticate the given client and return whether it succeeded
    pub async fn authenticate(&self, client: &mut Client) -> bool {
        if client.username.is_none() || client.password.is_none() {
            // Without credentials, access by ip[:port] may still be permitted
            let Some(allowed_ports) = self.allow_from.get(&client.address.to_string()) else {
                return false;
            };
            if !allowed_ports.is_empty() && !allowed_ports.contains(&client.port) {
                return false;
            }

            let hostname = resolve_name(client.address).await;
            client.name = if allowed_ports.is_empty() {
                Some(hostname)
            } else {
                Some(format!("{}:{}", hostname, client.port))
            };
            client.authenticated = true;
        } else {
            client.name = client.username.clone();
            if self.auth_backends.is_empty() {
                client.authenticated = self.peer_is_trusted(client);
            } else {
                for backend in &self.auth_backends {
                    let (username, password) = match (&client.username, &client.password) {
                        (Some(username), Some(password)) => (username.clone(), password.clone()),
                        _ => break,
                    };
                    match backend.authenticate(&username, &password).await {
                        Ok(true) => {
                            client.authenticated = true;
                            client.default_role = backend.default_role().map(str::to_string);
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(
                                client = %client,
                                backend = backend.name(),
                                error = %e,
                                "Failed to authenticate client"
                            );
                        }
                    }
                }
            }
        }

        if client.authenticated {
            self.populate(client).await;
        }

        client.authenticated
    }

    fn peer_is_trusted(&self, client: &Client) -> bool {
        let Some(peer_address) = client.peer_address else {
            return false;
        };
        let Some(trusted_ports) = self.trusted_proxies.get(&peer_address.to_string()) else {
            return false;
        };
        trusted_ports.is_empty()
            || client
                .peer_port
                .map_or(false, |port| trusted_ports.contains(&port))
    }

    /// Populate the group and role memberships of the given client
    pub async fn populate(&self, client: &mut Client) {
        if !self.group_backends.is_empty() && client.username.is_some() {
            debug!(client = %client, "Fetching group memberships");

            let username = client.username.clone().unwrap_or_default();
            let mut groups = Vec::new();
            let mut failed = false;
            for backend in &self.group_backends {
                match backend.get_group_memberships(&username).await {
                    Ok(memberships) => groups.extend(memberships),
                    Err(e) => {
                        failed = true;
                        error!(
                            client = %client,
                            backend = backend.name(),
                            error = %e,
                            "Failed to fetch group memberships"
                        );
                    }
                }
            }

            if !groups.is_empty() || !failed {
                debug!(
                    client = %client,
                    groups = groups.join(", "),
                    "Resolved group memberships"
                );
                client.groups = Some(groups);
            }
        } else {
            client.groups = Some(Vec::new());
        }

        if let Some(groups) = client.groups.clone() {
            debug!(client = %client, "Fetching role memberships");

            let username = client.username.clone().unwrap_or_else(|| client.to_string());
            match self.fetch_roles(&username, &groups).await {
                Ok(mut roles) => {
                    if roles.is_empty() {
                        if let Some(default_role) = &client.default_role {
                            match self.role_backend.get_role(default_role).await {
                                Ok(Some(role)) => roles.push(role),
                                Ok(None) => {}
                                Err(e) => error!(
                                    client = %client,
                                    role = default_role.as_str(),
                                    error = %e,
                                    "Failed to fetch default role"
                                ),
                            }
                        }
                    }

                    debug!(
                        client = %client,
                        roles = roles.iter().map(|r| r.id.as_str()).collect::<Vec<_>>().join(", "),
                        "Resolved role memberships"
                    );
                    client.set_roles(roles);
                    self.apply_system_defaults(client);
                }
                Err(e) => {
                    error!(client = %client, error = %e, "Failed to fetch role memberships");
                }
            }
        }
    }

    async fn fetch_roles(
        &self,
        username: &str,
        groups: &[String],
    ) -> crate::error::Result<Vec<Role>> {
        let mut key_parts: Vec<&str> = groups.iter().map(String::as_str).collect();
        key_parts.sort_unstable();
        let key = format!("{}\n{}", username, key_parts.join("\n"));

        if let Some(cached) = self.role_cache.lock().await.get(&key) {
            return Ok(cached.as_ref().clone());
        }

        let roles = self
            .role_backend
            .get_role_memberships(username, groups)
            .await?;
        let snapshot = Arc::new(roles.clone());
        self.role_cache.lock().await.put(key, snapshot);
        Ok(roles)
    }

    /// Inject the synthetic sysconfig role: clients holding the config
    /// meta-permissions get access to the configuration index, everyone
    /// else gets it hidden from every role's visible scope.
    fn apply_system_defaults(&self, client: &mut Client) {
        let mut permitted_config_types = Vec::new();
        if client.can("config/authentication", None, None, None) {
            permitted_config_types.push("user");
        }
        if client.can("config/authorization", None, None, None) {
            permitted_config_types.extend(["role", "role_user", "role_group"]);
        }

        let config_index = Pattern::new(self.config_index.as_str());
        let all_permissions = PermissionSet::new(vec![Pattern::new("*")]);

        let config_node = |types: &[&str]| IndexNode {
            restriction: Restriction::new(
                vec![config_index.clone()],
                Vec::new(),
                all_permissions.clone(),
            ),
            types: Some(vec![TypeNode {
                restriction: Restriction::new(
                    types.iter().map(|t| Pattern::new(*t)).collect(),
                    Vec::new(),
                    PermissionSet::default(),
                ),
                fields: None,
            }]),
        };
        let shadow_node = || IndexNode {
            restriction: Restriction::new(
                vec![Pattern::new("*")],
                vec![config_index.clone()],
                PermissionSet::default(),
            ),
            types: None,
        };

        if !permitted_config_types.is_empty() {
            let nodes = if client.is_restricted(RestrictedScope::Indices) {
                vec![config_node(&permitted_config_types)]
            } else {
                vec![shadow_node(), config_node(&permitted_config_types)]
            };
            let mut roles = client.roles.clone();
            roles.push(Role::new("sysconfig", nodes, PermissionSet::default()));
            client.set_roles(roles);
        } else if !client.is_restricted(RestrictedScope::Indices) {
            let mut roles = client.roles.clone();
            roles.push(Role::new(
                "sysconfig",
                vec![shadow_node()],
                PermissionSet::default(),
            ));
            client.set_roles(roles);
        } else {
            let mut roles = client.roles.clone();
            for role in &mut roles {
                role.add_exclusion(&config_index);
            }
            client.set_roles(roles);
        }
    }
}

/// Resolve the hostname of an address, falling back to the address itself
async fn resolve_name(address: IpAddr) -> String {
    let lookup =
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&address).ok());
    match tokio::time::timeout(NAME_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(Some(hostname))) => hostname,
        _ => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pat(s: &str) -> Pattern {
        Pattern::new(s)
    }

    fn filter(s: &str) -> FilterString {
        FilterString::from_string(s).unwrap()
    }

    fn client_with_roles(privileges: Vec<serde_json::Value>) -> Client {
        let mut client = Client::new("127.0.0.1".parse().unwrap(), 9200);
        let roles = privileges
            .into_iter()
            .enumerate()
            .map(|(i, p)| Role::from_json(format!("role-{i}"), &p).unwrap())
            .collect();
        client.set_roles(roles);
        client
    }

    #[test]
    fn test_restricted_scope_is_the_narrowest() {
        let client = client_with_roles(vec![
            json!({"indices": [{"include": "logs-*"}]}),
            json!({"indices": [{"include": "metrics-*", "types": [{"include": "cpu"}]}]}),
        ]);

        assert_eq!(client.restricted_scope(), Some(RestrictedScope::Types));
        assert!(client.is_restricted(RestrictedScope::Indices));
        assert!(client.is_restricted(RestrictedScope::Types));
        assert!(!client.is_restricted(RestrictedScope::Fields));
    }

    #[test]
    fn test_unrestricted_client_passes_requests_through() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "*", "permissions": ["api/search/documents"]}]
        })]);

        let result = client
            .create_filter_string("api/search/documents", Some(&filter("logs")), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(result.to_string(), "logs");
    }

    #[test]
    fn test_filter_narrowed_to_grant() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        // A requested wildcard is narrowed to the granted includes
        let result = client
            .create_filter_string("api/search/documents", Some(&filter("*")), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(result.to_string(), "logs-*");

        // A request within the grant stays as it is
        let result = client
            .create_filter_string(
                "api/search/documents",
                Some(&filter("logs-2016")),
                None,
                false,
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.to_string(), "logs-2016");
    }

    #[test]
    fn test_denied_index_filter() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        })]);

        let result = client
            .create_filter_string(
                "api/search/documents",
                Some(&filter("secrets")),
                None,
                false,
            )
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_collect_filters_deny_when_all_roles_indisposed() {
        let client = client_with_roles(vec![json!({
            "indices": [{"include": "logs-*", "permissions": ["api/indices/stats"]}]
        })]);

        assert_eq!(
            client.collect_filters("api/search/documents", None, None, None),
            CollectResult::Deny
        );
    }

    #[test]
    fn test_collect_filters_unrestricted_on_higher_grant() {
        let client = client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{"include": "events"}]
            }]
        })]);

        // At type scope below a matching index the role provides the type
        // restriction, at an unmatched index nothing applies
        assert_eq!(
            client.collect_filters("api/search/documents", None, Some(&pat("logs-1")), None),
            CollectResult::Filters(vec![(pat("events"), vec![])])
        );
    }

    #[test]
    fn test_collect_filters_broadest_access_pruning() {
        let client = client_with_roles(vec![
            json!({"indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]}),
            json!({"indices": [{"include": "logs-2016", "permissions": ["api/search/documents"]}]}),
        ]);

        // The narrower include is dropped in favor of the broader one
        match client.collect_filters("api/search/documents", None, None, None) {
            CollectResult::Filters(filters) => {
                assert_eq!(filters.len(), 1);
                assert_eq!(filters[0].0.text(), "logs-*");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_collect_filters_no_strictly_ordered_includes_remain() {
        let client = client_with_roles(vec![
            json!({"indices": [{"include": "*", "permissions": ["api/search/documents"]}]}),
            json!({"indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]}),
            json!({"indices": [{"include": "metrics-*", "permissions": ["api/search/documents"]}]}),
        ]);

        match client.collect_filters("api/search/documents", None, None, None) {
            CollectResult::Filters(filters) => {
                for (a, _) in &filters {
                    for (b, _) in &filters {
                        assert!(!(a > b), "{a} > {b} survived pruning");
                    }
                }
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_collect_filters_exclude_neutralization() {
        // The broad include carries an exclude the narrow include's role
        // permits again; dropping the narrow include exchanges the excludes
        let client = client_with_roles(vec![
            json!({"indices": [{
                "include": "logs-*",
                "exclude": "logs-2016*",
                "permissions": ["api/search/documents"]
            }]}),
            json!({"indices": [{
                "include": "logs-2016",
                "permissions": ["api/search/documents"]
            }]}),
        ]);

        match client.collect_filters("api/search/documents", None, None, None) {
            CollectResult::Filters(filters) => {
                assert_eq!(filters.len(), 1);
                assert_eq!(filters[0].0.text(), "logs-*");
                assert!(filters[0].1.is_empty(), "exclude was not neutralized");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_collect_filters_keeps_narrow_include_for_narrow_request() {
        let client = client_with_roles(vec![
            json!({"indices": [{
                "include": "logs-*",
                "exclude": "logs-2016*",
                "permissions": ["api/search/documents"]
            }]}),
            json!({"indices": [{
                "include": "logs-2016",
                "permissions": ["api/search/documents"]
            }]}),
        ]);

        // The client restricts itself to within the narrow include; the
        // broad one must go so its excludes cannot interfere
        let requested = filter("logs-2016");
        match client.collect_filters("api/search/documents", Some(&requested), None, None) {
            CollectResult::Filters(filters) => {
                assert_eq!(filters.len(), 1);
                assert_eq!(filters[0].0.text(), "logs-2016");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_multiple_includes_error() {
        let client = client_with_roles(vec![json!({
            "indices": [
                {"include": "logs-*", "permissions": ["api/search/documents"],
                 "types": [{"include": "events"}]},
                {"include": "metrics-*", "permissions": ["api/search/documents"],
                 "types": [{"include": "samples"}]}
            ]
        })]);

        let result =
            client.create_filter_string("api/search/documents", Some(&filter("")), None, true);
        match result {
            Err(error) => {
                assert_eq!(error.includes.len(), 2);
            }
            Ok(other) => panic!("expected MultipleIncludesError, got {other:?}"),
        }
    }

    #[test]
    fn test_source_filter_for_field_restricted_client() {
        let client = client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message", "@*"]}]
                }]
            }]
        })]);

        let source = client
            .create_source_filter(
                "api/search/documents",
                &filter("logs-2016"),
                &filter("events"),
                None,
            )
            .unwrap();
        let includes: Vec<_> = source.includes.iter().map(|p| p.text()).collect();
        assert_eq!(includes, vec!["message", "@*"]);

        let denied = client.create_source_filter(
            "api/search/documents",
            &filter("logs-2016"),
            &filter("other"),
            None,
        );
        assert!(denied.is_none());
    }

    #[test]
    fn test_fields_filter_for_field_restricted_client() {
        let client = client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message", "@*"]}]
                }]
            }]
        })]);

        let fields = client
            .create_fields_filter(
                "api/search/documents",
                &filter("logs-2016"),
                &filter("events"),
                Some(FieldsFilter::from_json(&json!(["message", "secret"]))),
            )
            .unwrap();
        let names: Vec<_> = fields.fields().iter().map(|p| p.text()).collect();
        assert_eq!(names, vec!["message"]);
    }

    #[test]
    fn test_has_restriction() {
        let client = client_with_roles(vec![json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message"]}]
                }]
            }]
        })]);

        assert!(client.has_restriction(&filter("logs-2016"), Some(&filter("events")), None));
        assert!(!client.has_restriction(&filter("metrics"), Some(&filter("events")), None));
    }
}
