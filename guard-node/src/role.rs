use serde_json::Value;
use thiserror::Error;

use crate::pattern::Pattern;

/// Error raised when a role document cannot be interpreted
#[derive(Error, Debug)]
pub enum RoleParseError {
    #[error("invalid role document: {0}")]
    InvalidDocument(String),
}

/// The scope levels at which a role can restrict a client, narrowest last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestrictedScope {
    Indices,
    Types,
    Fields,
}

impl RestrictedScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictedScope::Indices => "indices",
            RestrictedScope::Types => "types",
            RestrictedScope::Fields => "fields",
        }
    }
}

/// An ordered set of permission patterns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionSet {
    patterns: Vec<Pattern>,
}

impl PermissionSet {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self { patterns }
    }

    pub fn from_json(value: &Value) -> Self {
        let mut set = Self::default();
        match value {
            Value::String(permission) => set.insert(Pattern::new(permission.as_str())),
            Value::Array(permissions) => {
                for permission in permissions.iter().filter_map(Value::as_str) {
                    set.insert(Pattern::new(permission));
                }
            }
            _ => {}
        }
        set
    }

    pub fn insert(&mut self, pattern: Pattern) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    pub fn extend(&mut self, other: &PermissionSet) {
        for pattern in &other.patterns {
            self.insert(pattern.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether the requested permission is covered. Both sides may carry
    /// wildcards (`api/indices/get/*` asks for any of the get permissions),
    /// so the check is for overlap rather than containment.
    pub fn grants(&self, permission: &str) -> bool {
        let requested = Pattern::new(permission);
        self.patterns.iter().any(|p| p.intersects(&requested))
    }
}

/// A single restriction: include and exclude patterns plus the permissions
/// granted within them
#[derive(Debug, Clone, Default)]
pub struct Restriction {
    pub includes: Vec<Pattern>,
    pub excludes: Vec<Pattern>,
    pub permissions: PermissionSet,
}

impl Restriction {
    pub fn new(includes: Vec<Pattern>, excludes: Vec<Pattern>, permissions: PermissionSet) -> Self {
        Self {
            includes,
            excludes,
            permissions,
        }
    }

    /// Whether the given pattern falls within this restriction's scope
    pub fn matches(&self, pattern: &Pattern) -> bool {
        self.includes.iter().any(|i| i.matches(pattern))
            && !self.excludes.iter().any(|e| e.matches(pattern))
    }

    /// Whether this restriction covers everything without exception
    pub fn is_unbounded(&self) -> bool {
        self.excludes.is_empty() && self.includes.iter().any(Pattern::is_match_all)
    }

    fn from_json(value: &Value) -> Result<Self, RoleParseError> {
        let object = value
            .as_object()
            .ok_or_else(|| RoleParseError::InvalidDocument("restriction is not an object".into()))?;

        let includes = match object.get("include") {
            Some(value) => parse_patterns(value)?,
            None => vec![Pattern::new("*")],
        };
        let excludes = match object.get("exclude") {
            Some(value) => parse_patterns(value)?,
            None => Vec::new(),
        };
        let permissions = object
            .get("permissions")
            .map(PermissionSet::from_json)
            .unwrap_or_default();

        Ok(Self::new(includes, excludes, permissions))
    }
}

/// A type-level node of the restriction tree
#[derive(Debug, Clone)]
pub struct TypeNode {
    pub restriction: Restriction,
    pub fields: Option<Vec<Restriction>>,
}

/// An index-level node of the restriction tree
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub restriction: Restriction,
    pub types: Option<Vec<TypeNode>>,
}

/// Outcome of asking a role for the restrictions applying at a scope
#[derive(Debug)]
pub enum RoleRestrictions<'a> {
    /// The restrictions found, possibly none
    Found(Vec<&'a Restriction>),
    /// The scope matched, but the permission filter dropped every candidate
    WithoutPermission,
}

/// A role as stored in the configuration index: a tree of index, type and
/// field restrictions plus cluster-wide permissions.
///
/// Roles are immutable once handed to a client; the authorization engine
/// only ever reads them.
#[derive(Debug, Clone)]
pub struct Role {
    pub id: String,
    restrictions: Vec<IndexNode>,
    cluster_permissions: PermissionSet,
}

impl Role {
    pub fn new(
        id: impl Into<String>,
        restrictions: Vec<IndexNode>,
        cluster_permissions: PermissionSet,
    ) -> Self {
        Self {
            id: id.into(),
            restrictions,
            cluster_permissions,
        }
    }

    /// Parse a role from the `privileges` field of its document
    pub fn from_json(id: impl Into<String>, privileges: &Value) -> Result<Self, RoleParseError> {
        let object = privileges.as_object().ok_or_else(|| {
            RoleParseError::InvalidDocument("privileges is not an object".into())
        })?;

        let cluster_permissions = object
            .get("cluster")
            .map(PermissionSet::from_json)
            .unwrap_or_default();

        let mut restrictions = Vec::new();
        if let Some(indices) = object.get("indices") {
            let indices = indices.as_array().ok_or_else(|| {
                RoleParseError::InvalidDocument("indices is not a list".into())
            })?;

            for index in indices {
                let restriction = Restriction::from_json(index)?;
                let types = match index.get("types") {
                    Some(Value::Array(types)) => {
                        let mut nodes = Vec::new();
                        for doc_type in types {
                            let restriction = Restriction::from_json(doc_type)?;
                            let fields = match doc_type.get("fields") {
                                Some(Value::Array(fields)) => {
                                    let mut restrictions = Vec::new();
                                    for field in fields {
                                        restrictions.push(Restriction::from_json(field)?);
                                    }
                                    Some(restrictions)
                                }
                                Some(_) => {
                                    return Err(RoleParseError::InvalidDocument(
                                        "fields is not a list".into(),
                                    ))
                                }
                                None => None,
                            };
                            nodes.push(TypeNode { restriction, fields });
                        }
                        Some(nodes)
                    }
                    Some(_) => {
                        return Err(RoleParseError::InvalidDocument("types is not a list".into()))
                    }
                    None => None,
                };

                restrictions.push(IndexNode { restriction, types });
            }
        }

        Ok(Self::new(id, restrictions, cluster_permissions))
    }

    pub fn index_nodes(&self) -> &[IndexNode] {
        &self.restrictions
    }

    /// Exclude the given pattern from every index restriction covering it
    pub fn add_exclusion(&mut self, pattern: &Pattern) {
        for node in &mut self.restrictions {
            if node.restriction.matches(pattern)
                && !node.restriction.excludes.contains(pattern)
            {
                node.restriction.excludes.push(pattern.clone());
            }
        }
    }

    /// The narrowest level at which this role restricts anything
    pub fn get_restricted_scope(&self) -> Option<RestrictedScope> {
        let mut scope = None;
        for node in &self.restrictions {
            match &node.types {
                Some(types) => {
                    if types.iter().any(|t| t.fields.is_some()) {
                        return Some(RestrictedScope::Fields);
                    }
                    scope = scope.max(Some(RestrictedScope::Types));
                }
                None => scope = scope.max(Some(RestrictedScope::Indices)),
            }
        }
        scope
    }

    /// Collect the lowest-level restrictions applying at the given scope.
    ///
    /// Without a permission, all candidates are returned. With one, only
    /// candidates whose effective permission set (the union along the chain
    /// from the index node down) grants it — or, when `invert` is set, only
    /// those that do not. `WithoutPermission` signals that the scope matched
    /// but the permission ruled every candidate out, which callers must
    /// distinguish from an unmatched scope.
    pub fn get_restrictions(
        &self,
        index: Option<&Pattern>,
        document_type: Option<&Pattern>,
        permission: Option<&str>,
        invert: bool,
    ) -> RoleRestrictions<'_> {
        let mut candidates: Vec<(&Restriction, PermissionSet)> = Vec::new();

        match index {
            None => {
                for node in &self.restrictions {
                    candidates.push((&node.restriction, node.restriction.permissions.clone()));
                }
            }
            Some(index) => {
                for node in &self.restrictions {
                    if !node.restriction.matches(index) {
                        continue;
                    }

                    let Some(types) = &node.types else {
                        continue;
                    };

                    match document_type {
                        None => {
                            for type_node in types {
                                let mut effective = node.restriction.permissions.clone();
                                effective.extend(&type_node.restriction.permissions);
                                candidates.push((&type_node.restriction, effective));
                            }
                        }
                        Some(document_type) => {
                            for type_node in types {
                                if !type_node.restriction.matches(document_type) {
                                    continue;
                                }

                                let Some(fields) = &type_node.fields else {
                                    continue;
                                };

                                for field in fields {
                                    let mut effective = node.restriction.permissions.clone();
                                    effective.extend(&type_node.restriction.permissions);
                                    effective.extend(&field.permissions);
                                    candidates.push((field, effective));
                                }
                            }
                        }
                    }
                }
            }
        }

        let Some(permission) = permission else {
            return RoleRestrictions::Found(candidates.into_iter().map(|(r, _)| r).collect());
        };

        let had_candidates = !candidates.is_empty();
        let passing: Vec<&Restriction> = candidates
            .into_iter()
            .filter(|(_, effective)| effective.grants(permission) != invert)
            .map(|(r, _)| r)
            .collect();

        if passing.is_empty() && had_candidates && !invert {
            RoleRestrictions::WithoutPermission
        } else {
            RoleRestrictions::Found(passing)
        }
    }

    /// Whether this role grants the permission in the given context
    pub fn permits(
        &self,
        permission: &str,
        index: Option<&Pattern>,
        document_type: Option<&Pattern>,
        field: Option<&Pattern>,
    ) -> bool {
        let Some(index) = index else {
            // Cluster permissions, or an unbounded index grant
            return self.cluster_permissions.grants(permission)
                || self.restrictions.iter().any(|node| {
                    node.restriction.is_unbounded()
                        && node.restriction.permissions.grants(permission)
                });
        };

        for node in &self.restrictions {
            if !node.restriction.matches(index) {
                continue;
            }

            let Some(document_type) = document_type else {
                if node.restriction.permissions.grants(permission) {
                    return true;
                }
                continue;
            };

            let Some(types) = &node.types else {
                // No type restrictions below this index
                if node.restriction.permissions.grants(permission) {
                    return true;
                }
                continue;
            };

            for type_node in types {
                if !type_node.restriction.matches(document_type) {
                    continue;
                }

                let mut effective = node.restriction.permissions.clone();
                effective.extend(&type_node.restriction.permissions);

                let Some(field) = field else {
                    if effective.grants(permission) {
                        return true;
                    }
                    continue;
                };

                let Some(fields) = &type_node.fields else {
                    if effective.grants(permission) {
                        return true;
                    }
                    continue;
                };

                for field_restriction in fields {
                    if !field_restriction.matches(field) {
                        continue;
                    }

                    let mut effective = effective.clone();
                    effective.extend(&field_restriction.permissions);
                    if effective.grants(permission) {
                        return true;
                    }
                }
            }
        }

        false
    }
}

fn parse_patterns(value: &Value) -> Result<Vec<Pattern>, RoleParseError> {
    match value {
        Value::String(pattern) => Ok(vec![Pattern::new(pattern.as_str())]),
        Value::Array(patterns) => {
            let mut result = Vec::new();
            for pattern in patterns {
                match pattern.as_str() {
                    Some(pattern) => result.push(Pattern::new(pattern)),
                    None => {
                        return Err(RoleParseError::InvalidDocument(
                            "pattern is not a string".into(),
                        ))
                    }
                }
            }
            Ok(result)
        }
        _ => Err(RoleParseError::InvalidDocument(
            "pattern is neither a string nor a list".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pat(s: &str) -> Pattern {
        Pattern::new(s)
    }

    fn search_role(privileges: Value) -> Role {
        Role::from_json("test", &privileges).unwrap()
    }

    #[test]
    fn test_role_parsing() {
        let role = search_role(json!({
            "cluster": ["api/cluster/health"],
            "indices": [{
                "include": "logs-*",
                "exclude": "logs-secret*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": ["events"],
                    "fields": [{"include": ["message", "@*"]}]
                }]
            }]
        }));

        assert_eq!(role.id, "test");
        assert_eq!(role.index_nodes().len(), 1);
        assert_eq!(role.get_restricted_scope(), Some(RestrictedScope::Fields));
    }

    #[test]
    fn test_restricted_scope_levels() {
        let indices = search_role(json!({"indices": [{"include": "logs-*"}]}));
        assert_eq!(
            indices.get_restricted_scope(),
            Some(RestrictedScope::Indices)
        );

        let types = search_role(json!({
            "indices": [{"include": "logs-*", "types": [{"include": "events"}]}]
        }));
        assert_eq!(types.get_restricted_scope(), Some(RestrictedScope::Types));

        let unrestricted = search_role(json!({"cluster": ["api/bulk"]}));
        assert_eq!(unrestricted.get_restricted_scope(), None);
    }

    #[test]
    fn test_permits_at_index_level() {
        let role = search_role(json!({
            "indices": [{"include": "logs-*", "permissions": ["api/search/documents"]}]
        }));

        assert!(role.permits("api/search/documents", Some(&pat("logs-2016")), None, None));
        assert!(!role.permits("api/search/documents", Some(&pat("secrets")), None, None));
        assert!(!role.permits("api/indices/delete/index", Some(&pat("logs-2016")), None, None));
    }

    #[test]
    fn test_permits_cluster_scope() {
        let role = search_role(json!({"cluster": ["api/bulk"]}));
        assert!(role.permits("api/bulk", None, None, None));
        assert!(!role.permits("api/cat", None, None, None));

        // An unbounded wildcard grant covers cluster checks too
        let role = search_role(json!({
            "indices": [{"include": "*", "permissions": "*"}]
        }));
        assert!(role.permits("api/cat", None, None, None));

        let role = search_role(json!({
            "indices": [{"include": "*", "exclude": "secrets", "permissions": "*"}]
        }));
        assert!(!role.permits("api/cat", None, None, None));
    }

    #[test]
    fn test_permits_descends_to_fields() {
        let role = search_role(json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{
                    "include": "events",
                    "fields": [{"include": ["message"]}]
                }]
            }]
        }));

        assert!(role.permits(
            "api/search/documents",
            Some(&pat("logs-2016")),
            Some(&pat("events")),
            Some(&pat("message"))
        ));
        assert!(!role.permits(
            "api/search/documents",
            Some(&pat("logs-2016")),
            Some(&pat("events")),
            Some(&pat("secret"))
        ));
        assert!(!role.permits(
            "api/search/documents",
            Some(&pat("logs-2016")),
            Some(&pat("other")),
            Some(&pat("message"))
        ));
    }

    #[test]
    fn test_permission_wildcards_overlap() {
        let set = PermissionSet::new(vec![pat("api/indices/get/settings")]);
        assert!(set.grants("api/indices/get/*"));
        assert!(set.grants("api/indices/get/settings"));
        assert!(!set.grants("api/indices/get/mappings"));

        let set = PermissionSet::new(vec![pat("api/indices/*")]);
        assert!(set.grants("api/indices/get/settings"));
    }

    #[test]
    fn test_get_restrictions_index_scope() {
        let role = search_role(json!({
            "indices": [
                {"include": "logs-*", "permissions": ["api/search/documents"]},
                {"include": "metrics-*", "permissions": ["api/indices/stats"]}
            ]
        }));

        match role.get_restrictions(None, None, Some("api/search/documents"), false) {
            RoleRestrictions::Found(found) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].includes[0].text(), "logs-*");
            }
            RoleRestrictions::WithoutPermission => panic!("expected restrictions"),
        }

        match role.get_restrictions(None, None, Some("api/documents/delete"), false) {
            RoleRestrictions::WithoutPermission => {}
            RoleRestrictions::Found(_) => panic!("expected WithoutPermission"),
        }
    }

    #[test]
    fn test_get_restrictions_type_scope() {
        let role = search_role(json!({
            "indices": [{
                "include": "logs-*",
                "permissions": ["api/search/documents"],
                "types": [{"include": "events"}]
            }]
        }));

        // Type nodes inherit the index permissions
        match role.get_restrictions(
            Some(&pat("logs-2016")),
            None,
            Some("api/search/documents"),
            false,
        ) {
            RoleRestrictions::Found(found) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].includes[0].text(), "events");
            }
            RoleRestrictions::WithoutPermission => panic!("expected restrictions"),
        }

        // An index without type restrictions yields nothing at type scope
        match role.get_restrictions(Some(&pat("other")), None, None, false) {
            RoleRestrictions::Found(found) => assert!(found.is_empty()),
            RoleRestrictions::WithoutPermission => panic!("scope cannot match"),
        }
    }

    #[test]
    fn test_get_restrictions_inverted() {
        let role = search_role(json!({
            "indices": [
                {"include": "logs-*", "permissions": ["api/search/documents"]},
                {"include": "metrics-*"}
            ]
        }));

        match role.get_restrictions(None, None, Some("api/search/documents"), true) {
            RoleRestrictions::Found(found) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].includes[0].text(), "metrics-*");
            }
            RoleRestrictions::WithoutPermission => panic!("inverted lookups never signal this"),
        }
    }

    #[test]
    fn test_add_exclusion() {
        let mut role = search_role(json!({
            "indices": [{"include": "*", "permissions": "*"}]
        }));

        role.add_exclusion(&pat(".elasticguard"));
        assert!(!role.index_nodes()[0].restriction.matches(&pat(".elasticguard")));
        assert!(role.index_nodes()[0].restriction.matches(&pat("logs")));
    }
}
