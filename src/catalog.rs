//! Challenge metadata: users, dojos, modules, and challenges.
//!
//! The metadata store itself is an external collaborator; this module
//! defines the records and the [`Catalog`] interface the provisioning
//! core consumes, plus [`FileCatalog`], which loads the records from a
//! TOML file the way dojos are defined by on-disk specs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// A platform user.
#[derive(Debug, Clone)]
pub struct User {
    /// Numeric user id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Whether the user is a global administrator.
    pub admin: bool,
    /// The engine node this user's workspaces run on, if pinned.
    pub node: Option<u32>,
    /// Award names held by the user (e.g. `INTERNET`).
    pub awards: Vec<String>,
}

/// A dojo member record.
#[derive(Debug, Clone, Deserialize)]
pub struct DojoStudent {
    /// The member's user id.
    pub user_id: i64,
    /// Whether the member is an official student.
    pub official: bool,
}

/// A dojo: a collection of modules.
#[derive(Debug, Clone)]
pub struct Dojo {
    /// Numeric dojo id.
    pub id: i64,
    /// Stable reference id used in URLs and labels.
    pub reference_id: String,
    /// Display name.
    pub name: String,
    /// Whether the dojo is official.
    pub official: bool,
    /// Dojo type (e.g. `public`), if any.
    pub dojo_type: Option<String>,
    /// Dojo-level permission grants (e.g. `workspace_net_admin`).
    pub permissions: HashSet<String>,
    /// User ids of dojo administrators.
    pub admins: HashSet<i64>,
    /// Enrolled students.
    pub students: Vec<DojoStudent>,
}

impl Dojo {
    /// Whether the given user administers this dojo.
    pub fn is_admin(&self, user: &User) -> bool {
        user.admin || self.admins.contains(&user.id)
    }

    /// Whether container-start events for this dojo go to the feed.
    pub fn feed_visible(&self) -> bool {
        self.official || self.dojo_type.as_deref() == Some("public")
    }
}

/// A module: an ordered collection of challenges.
#[derive(Debug, Clone)]
pub struct DojoModule {
    /// Module id within the dojo.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Position of the module within the dojo.
    pub index: i64,
}

/// A challenge within a module.
#[derive(Debug, Clone)]
pub struct DojoChallenge {
    /// Challenge id within the dojo.
    pub id: String,
    /// Global numeric challenge id, used for flags and option selection.
    pub challenge_id: i64,
    /// Display name.
    pub name: String,
    /// Description shown on container labels.
    pub description: String,
    /// Workspace image.
    pub image: String,
    /// Challenge material directory on the host, if any.
    pub path: Option<PathBuf>,
    /// Whether the workspace runs privileged (VM-isolated runtime).
    pub privileged: bool,
    /// Whether practice mode is allowed.
    pub allow_privileged: bool,
    /// Whether the challenge is visible to non-admins.
    pub visible: bool,
    /// Position of the challenge within its module.
    pub index: i64,
    /// The module this challenge belongs to.
    pub module: DojoModule,
}

impl DojoChallenge {
    /// Resolve the challenge against its dojo into the container-facing
    /// subset of its metadata.
    pub fn resolve(&self, dojo: &Dojo) -> ResolvedChallenge {
        ResolvedChallenge {
            image: self.image.clone(),
            privileged: self.privileged,
            permissions: dojo.permissions.clone(),
        }
    }
}

/// The resolved, container-facing view of a challenge.
#[derive(Debug, Clone)]
pub struct ResolvedChallenge {
    /// Workspace image.
    pub image: String,
    /// Whether the workspace runs privileged.
    pub privileged: bool,
    /// Dojo-level permission grants.
    pub permissions: HashSet<String>,
}

/// Workspace token resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token does not correspond to a user.
    #[error("Invalid workspace token")]
    Unknown,
    /// The token exists but has expired.
    #[error("This workspace token has expired")]
    Expired,
    /// The metadata store failed.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Read access to the challenge metadata store.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve an authenticated session token to its user.
    async fn session_user(&self, token: &str) -> Result<Option<User>>;

    /// Load a user by id.
    async fn user(&self, id: i64) -> Result<Option<User>>;

    /// Load a dojo by reference id, without an access check.
    async fn dojo(&self, reference: &str) -> Result<Option<Dojo>>;

    /// Load a dojo by reference id if it is accessible to the user.
    async fn accessible_dojo(&self, user: &User, reference: &str) -> Result<Option<Dojo>>;

    /// Load a challenge, optionally constrained to a module.
    async fn challenge(
        &self,
        dojo: &Dojo,
        module_id: Option<&str>,
        challenge_id: &str,
    ) -> Result<Option<DojoChallenge>>;

    /// Whether the challenge is currently locked for the user.
    async fn challenge_locked(
        &self,
        user: &User,
        dojo: &Dojo,
        challenge: &DojoChallenge,
    ) -> Result<bool>;

    /// Resolve a workspace token to its designated user.
    async fn workspace_token_user(&self, token: &str) -> std::result::Result<User, TokenError>;

    /// The challenges of a module, in order.
    async fn module_challenges(&self, dojo: &Dojo, module_id: &str) -> Result<Vec<DojoChallenge>>;

    /// The module after the given index within the dojo, if any.
    async fn next_module(&self, dojo: &Dojo, module_index: i64) -> Result<Option<DojoModule>>;
}

/// A user record as it appears in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileUser {
    /// Numeric user id.
    id: i64,
    /// Display name.
    name: String,
    /// Global administrator flag.
    #[serde(default)]
    admin: bool,
    /// Pinned engine node, if any.
    #[serde(default)]
    node: Option<u32>,
    /// Held awards.
    #[serde(default)]
    awards: Vec<String>,
    /// Session token accepted for this user.
    #[serde(default)]
    session_token: Option<String>,
    /// Workspace token designating this user as an impersonation target.
    #[serde(default)]
    workspace_token: Option<String>,
    /// Whether the workspace token has expired.
    #[serde(default)]
    workspace_token_expired: bool,
}

impl FileUser {
    /// The runtime user record.
    fn to_user(&self) -> User {
        User {
            id: self.id,
            name: self.name.clone(),
            admin: self.admin,
            node: self.node,
            awards: self.awards.clone(),
        }
    }
}

/// A challenge record as it appears in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileChallenge {
    /// Challenge id within the dojo.
    id: String,
    /// Global numeric challenge id.
    challenge_id: i64,
    /// Display name.
    name: String,
    /// Description shown on container labels.
    #[serde(default)]
    description: String,
    /// Workspace image.
    image: String,
    /// Challenge material directory, if any.
    #[serde(default)]
    path: Option<PathBuf>,
    /// Privileged workspace flag.
    #[serde(default)]
    privileged: bool,
    /// Practice mode allowed flag.
    #[serde(default = "default_true")]
    allow_privileged: bool,
    /// Visibility flag.
    #[serde(default = "default_true")]
    visible: bool,
    /// Whether the challenge is locked.
    #[serde(default)]
    locked: bool,
}

/// Serde default for flags that default on.
fn default_true() -> bool {
    true
}

/// A module record as it appears in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileModule {
    /// Module id within the dojo.
    id: String,
    /// Display name.
    name: String,
    /// The module's challenges, in order.
    #[serde(default)]
    challenges: Vec<FileChallenge>,
}

/// A dojo record as it appears in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDojo {
    /// Numeric dojo id.
    id: i64,
    /// Stable reference id.
    reference: String,
    /// Display name.
    name: String,
    /// Official flag.
    #[serde(default)]
    official: bool,
    /// Dojo type, if any.
    #[serde(default, rename = "type")]
    dojo_type: Option<String>,
    /// Whether the dojo is open to every user.
    #[serde(default = "default_true")]
    public: bool,
    /// Dojo-level permission grants.
    #[serde(default)]
    permissions: Vec<String>,
    /// Administrator user ids.
    #[serde(default)]
    admins: Vec<i64>,
    /// Enrolled students.
    #[serde(default)]
    students: Vec<DojoStudent>,
    /// The dojo's modules, in order.
    #[serde(default)]
    modules: Vec<FileModule>,
}

/// The catalog file root.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    /// All users.
    #[serde(default)]
    users: Vec<FileUser>,
    /// All dojos.
    #[serde(default)]
    dojos: Vec<FileDojo>,
}

/// A dojo loaded into its runtime shape.
#[derive(Debug, Clone)]
struct LoadedDojo {
    /// The dojo record.
    dojo: Dojo,
    /// Whether the dojo is open to every user.
    public: bool,
    /// Modules, in order.
    modules: Vec<DojoModule>,
    /// Challenges keyed by module id, in order.
    challenges: HashMap<String, Vec<DojoChallenge>>,
    /// Ids of locked challenges.
    locked: HashSet<String>,
}

/// Catalog implementation backed by a TOML file.
#[derive(Debug)]
pub struct FileCatalog {
    /// All users.
    users: Vec<FileUser>,
    /// All dojos, keyed by reference id.
    dojos: HashMap<String, LoadedDojo>,
}

impl FileCatalog {
    /// Load the catalog from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file `{}`", path.display()))?;
        Self::from_toml(&contents)
    }

    /// Load the catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid catalog.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(contents).context("failed to parse catalog")?;

        let mut dojos = HashMap::new();
        for file_dojo in file.dojos {
            let dojo = Dojo {
                id: file_dojo.id,
                reference_id: file_dojo.reference.clone(),
                name: file_dojo.name,
                official: file_dojo.official,
                dojo_type: file_dojo.dojo_type,
                permissions: file_dojo.permissions.into_iter().collect(),
                admins: file_dojo.admins.into_iter().collect(),
                students: file_dojo.students,
            };

            let mut modules = Vec::new();
            let mut challenges = HashMap::new();
            let mut locked = HashSet::new();
            for (module_index, file_module) in file_dojo.modules.into_iter().enumerate() {
                let module = DojoModule {
                    id: file_module.id.clone(),
                    name: file_module.name,
                    index: module_index as i64,
                };

                let module_challenges: Vec<DojoChallenge> = file_module
                    .challenges
                    .into_iter()
                    .enumerate()
                    .map(|(challenge_index, c)| {
                        if c.locked {
                            locked.insert(c.id.clone());
                        }
                        DojoChallenge {
                            id: c.id,
                            challenge_id: c.challenge_id,
                            name: c.name,
                            description: c.description,
                            image: c.image,
                            path: c.path,
                            privileged: c.privileged,
                            allow_privileged: c.allow_privileged,
                            visible: c.visible,
                            index: challenge_index as i64,
                            module: module.clone(),
                        }
                    })
                    .collect();

                challenges.insert(file_module.id, module_challenges);
                modules.push(module);
            }

            dojos.insert(
                file_dojo.reference,
                LoadedDojo {
                    dojo,
                    public: file_dojo.public,
                    modules,
                    challenges,
                    locked,
                },
            );
        }

        Ok(Self {
            users: file.users,
            dojos,
        })
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn session_user(&self, token: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.session_token.as_deref() == Some(token))
            .map(FileUser::to_user))
    }

    async fn user(&self, id: i64) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.id == id)
            .map(FileUser::to_user))
    }

    async fn dojo(&self, reference: &str) -> Result<Option<Dojo>> {
        Ok(self.dojos.get(reference).map(|d| d.dojo.clone()))
    }

    async fn accessible_dojo(&self, user: &User, reference: &str) -> Result<Option<Dojo>> {
        let Some(loaded) = self.dojos.get(reference) else {
            return Ok(None);
        };

        let member = loaded.dojo.is_admin(user)
            || loaded.dojo.students.iter().any(|s| s.user_id == user.id);
        if loaded.public || member {
            Ok(Some(loaded.dojo.clone()))
        } else {
            Ok(None)
        }
    }

    async fn challenge(
        &self,
        dojo: &Dojo,
        module_id: Option<&str>,
        challenge_id: &str,
    ) -> Result<Option<DojoChallenge>> {
        let Some(loaded) = self.dojos.get(&dojo.reference_id) else {
            return Ok(None);
        };

        let found = match module_id {
            Some(module_id) => loaded
                .challenges
                .get(module_id)
                .and_then(|cs| cs.iter().find(|c| c.id == challenge_id)),
            None => loaded
                .challenges
                .values()
                .flatten()
                .find(|c| c.id == challenge_id),
        };

        Ok(found.cloned())
    }

    async fn challenge_locked(
        &self,
        _user: &User,
        dojo: &Dojo,
        challenge: &DojoChallenge,
    ) -> Result<bool> {
        Ok(self
            .dojos
            .get(&dojo.reference_id)
            .is_some_and(|d| d.locked.contains(&challenge.id)))
    }

    async fn workspace_token_user(&self, token: &str) -> std::result::Result<User, TokenError> {
        let user = self
            .users
            .iter()
            .find(|u| u.workspace_token.as_deref() == Some(token))
            .ok_or(TokenError::Unknown)?;

        if user.workspace_token_expired {
            return Err(TokenError::Expired);
        }

        Ok(user.to_user())
    }

    async fn module_challenges(&self, dojo: &Dojo, module_id: &str) -> Result<Vec<DojoChallenge>> {
        Ok(self
            .dojos
            .get(&dojo.reference_id)
            .and_then(|d| d.challenges.get(module_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn next_module(&self, dojo: &Dojo, module_index: i64) -> Result<Option<DojoModule>> {
        Ok(self
            .dojos
            .get(&dojo.reference_id)
            .and_then(|d| d.modules.iter().find(|m| m.index == module_index + 1))
            .cloned())
    }
}
