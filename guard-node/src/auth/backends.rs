use std::time::Duration;

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::LdapConfig;
use crate::error::{GuardError, Result};
use crate::role::Role;

/// Source of role definitions for authenticated clients
#[async_trait]
pub trait RoleBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the roles the given user or any of its groups is a member of
    async fn get_role_memberships(&self, username: &str, groups: &[String]) -> Result<Vec<Role>>;

    /// Fetch a single role by its id
    async fn get_role(&self, id: &str) -> Result<Option<Role>>;
}

/// Source of group memberships for authenticated clients
#[async_trait]
pub trait GroupBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get_group_memberships(&self, username: &str) -> Result<Vec<String>>;
}

/// Credential validator for clients presenting basic authentication
#[async_trait]
pub trait AuthenticationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Role assigned to users this backend authenticates that have no
    /// role membership of their own
    fn default_role(&self) -> Option<&str>;

    async fn authenticate(&self, username: &str, password: &str) -> Result<bool>;
}

/// Role backend reading role documents from the configuration index of the
/// upstream Elasticsearch cluster itself
pub struct ElasticsearchRoleBackend {
    http: reqwest::Client,
    nodes: Vec<String>,
    config_index: String,
}

impl ElasticsearchRoleBackend {
    pub fn new(nodes: Vec<String>, config_index: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GuardError::RoleBackend(e.to_string()))?;

        Ok(Self {
            http,
            nodes,
            config_index,
        })
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut last_error = None;
        for node in &self.nodes {
            let url = format!("{}{}", node, path);
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| GuardError::RoleBackend(e.to_string()));
                }
                Err(e) => {
                    warn!(node = node.as_str(), error = %e, "Role backend node unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(GuardError::RoleBackend(
            last_error.map_or_else(|| "no nodes configured".to_string(), |e| e.to_string()),
        ))
    }

    fn parse_hit(hit: &Value) -> Option<Role> {
        let id = hit.get("_id").and_then(Value::as_str)?;
        let privileges = hit.pointer("/_source/privileges")?;
        match Role::from_json(id, privileges) {
            Ok(role) => Some(role),
            Err(e) => {
                warn!(role = id, error = %e, "Skipping malformed role document");
                None
            }
        }
    }
}

#[async_trait]
impl RoleBackend for ElasticsearchRoleBackend {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn get_role_memberships(&self, username: &str, groups: &[String]) -> Result<Vec<Role>> {
        let query = json!({
            "query": {
                "filtered": {
                    "filter": {
                        "bool": {
                            "should": [
                                {"terms": {"users": [username]}},
                                {"terms": {"groups": groups}}
                            ]
                        }
                    }
                }
            },
            "size": 1000
        });

        let path = format!("/{}/role/_search", self.config_index);
        let response = self.request(reqwest::Method::POST, &path, Some(&query)).await?;

        let mut roles = Vec::new();
        if let Some(hits) = response.pointer("/hits/hits").and_then(Value::as_array) {
            for hit in hits {
                if let Some(role) = Self::parse_hit(hit) {
                    roles.push(role);
                }
            }
        }

        debug!(
            username = username,
            roles = roles.len(),
            "Fetched role memberships"
        );
        Ok(roles)
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        let path = format!("/{}/role/{}", self.config_index, id);
        let response = self.request(reqwest::Method::GET, &path, None).await?;

        if !response.get("found").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }

        match response.pointer("/_source/privileges") {
            Some(privileges) => Role::from_json(id, privileges)
                .map(Some)
                .map_err(|e| GuardError::RoleBackend(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Group backend resolving memberships through a LDAP directory, in plain
/// or Active Directory flavor
pub struct LdapUsergroupBackend {
    flavor: String,
    settings: LdapConfig,
}

impl LdapUsergroupBackend {
    pub fn new(flavor: impl Into<String>, settings: LdapConfig) -> Self {
        Self {
            flavor: flavor.into(),
            settings,
        }
    }

    fn attribute(&self, value: Option<&str>, what: &str) -> Result<String> {
        value
            .map(str::to_string)
            .ok_or_else(|| GuardError::GroupBackend(format!("missing ldap setting: {what}")))
    }

    async fn connect(&self) -> Result<ldap3::Ldap> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.settings.url)
            .await
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?;
        ldap3::drive!(conn);

        ldap.simple_bind(&self.settings.bind_dn, &self.settings.bind_pw)
            .await
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?
            .success()
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?;

        Ok(ldap)
    }

    /// Locate the DN of the given user beneath the user base DN
    async fn find_user_dn(&self, ldap: &mut ldap3::Ldap, username: &str) -> Result<Option<String>> {
        let object_class =
            self.attribute(self.settings.user_object_class(&self.flavor), "user_object_class")?;
        let name_attribute = self.attribute(
            self.settings.user_name_attribute(&self.flavor),
            "user_name_attribute",
        )?;

        let filter = format!(
            "(&(objectClass={})({}={}))",
            object_class,
            name_attribute,
            ldap_escape(username)
        );
        let (entries, _) = ldap
            .search(
                &self.settings.user_base_dn,
                Scope::Subtree,
                &filter,
                Vec::<&str>::new(),
            )
            .await
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?
            .success()
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|entry| SearchEntry::construct(entry).dn))
    }
}

#[async_trait]
impl GroupBackend for LdapUsergroupBackend {
    fn name(&self) -> &str {
        "ldap"
    }

    async fn get_group_memberships(&self, username: &str) -> Result<Vec<String>> {
        let mut ldap = self.connect().await?;

        let Some(user_dn) = self.find_user_dn(&mut ldap, username).await? else {
            debug!(username = username, "User not found in directory");
            return Ok(Vec::new());
        };

        let object_class = self.attribute(
            self.settings.group_object_class(&self.flavor),
            "group_object_class",
        )?;
        let name_attribute = self.attribute(
            self.settings.group_name_attribute(&self.flavor),
            "group_name_attribute",
        )?;
        let membership_attribute = self.attribute(
            self.settings.group_membership_attribute(&self.flavor),
            "group_membership_attribute",
        )?;

        let filter = format!(
            "(&(objectClass={})({}={}))",
            object_class,
            membership_attribute,
            ldap_escape(user_dn.as_str())
        );
        let (entries, _) = ldap
            .search(
                &self.settings.group_base_dn,
                Scope::Subtree,
                &filter,
                vec![name_attribute.as_str()],
            )
            .await
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?
            .success()
            .map_err(|e| GuardError::GroupBackend(e.to_string()))?;

        let mut groups = Vec::new();
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            if let Some(values) = entry.attrs.get(name_attribute.as_str()) {
                groups.extend(values.iter().cloned());
            }
        }

        let _ = ldap.unbind().await;
        debug!(
            username = username,
            groups = groups.len(),
            "Fetched group memberships"
        );
        Ok(groups)
    }
}

/// Authentication backend validating credentials with a bind against the
/// directory
pub struct LdapAuthenticationBackend {
    groups: LdapUsergroupBackend,
    default_role: Option<String>,
}

impl LdapAuthenticationBackend {
    pub fn new(flavor: impl Into<String>, settings: LdapConfig) -> Self {
        let default_role = settings.default_role.clone();
        Self {
            groups: LdapUsergroupBackend::new(flavor, settings),
            default_role,
        }
    }
}

#[async_trait]
impl AuthenticationBackend for LdapAuthenticationBackend {
    fn name(&self) -> &str {
        "ldap"
    }

    fn default_role(&self) -> Option<&str> {
        self.default_role.as_deref()
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        // Anonymous binds must not pass as successful authentication
        if password.is_empty() {
            return Ok(false);
        }

        let mut ldap = self.groups.connect().await?;
        let Some(user_dn) = self.groups.find_user_dn(&mut ldap, username).await? else {
            return Ok(false);
        };
        let _ = ldap.unbind().await;

        let (conn, mut ldap) = LdapConnAsync::new(&self.groups.settings.url)
            .await
            .map_err(|e| GuardError::AuthBackend(e.to_string()))?;
        ldap3::drive!(conn);

        let result = ldap
            .simple_bind(&user_dn, password)
            .await
            .map_err(|e| GuardError::AuthBackend(e.to_string()))?;
        let _ = ldap.unbind().await;

        Ok(result.rc == 0)
    }
}
