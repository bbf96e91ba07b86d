use std::fmt;
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};

use crate::{auth::Access, message::Message};

/// Handler invoked on a worker thread for a dispatched command.
pub type CommandHandler = Arc<dyn Fn(Message) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Fire-and-forget: no reply tag, no reply.
    Plain,
    /// The caller supplies a reply tag and expects exactly one `REPLY`.
    Request,
}

pub struct CommandRecord {
    pub handler: CommandHandler,
    pub kind: CommandKind,
    /// Overrides the category default when set.
    pub access: Option<Access>,
}

struct Category {
    access: Access,
    commands: HashMap<String, CommandRecord>,
}

/// Registration failure, surfaced synchronously to the embedder.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Category and command names must be non-empty and must not contain the
    /// `'.'` separator.
    InvalidName(String),
    DuplicateCategory(String),
    DuplicateCommand(String),
}

impl std::error::Error for RegistryError {}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid registration name: {name:?}"),
            Self::DuplicateCategory(name) => write!(f, "category already registered: {name}"),
            Self::DuplicateCommand(name) => write!(f, "command already registered: {name}"),
        }
    }
}

/// A command resolved for dispatch: the handler, its kind, and the effective
/// access policy (the per-command override if present, the category default
/// otherwise).
pub struct Resolved {
    pub handler: CommandHandler,
    pub kind: CommandKind,
    pub access: Access,
}

/// Mapping from `category.command` names to handlers and access policies.
///
/// Populated before the node starts and immutable afterwards, so dispatch
/// reads take no locks.
#[derive(Default)]
pub struct Registry {
    categories: HashMap<String, Category>,
}

impl Registry {
    /// Registers a category and returns a builder for its commands.
    pub fn add_category(
        &mut self,
        name: impl Into<String>,
        access: impl Into<Access>,
    ) -> Result<CategoryBuilder<'_>, RegistryError> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(RegistryError::InvalidName(name));
        }

        if self.categories.contains_key(&name) {
            return Err(RegistryError::DuplicateCategory(name));
        }

        let category = self.categories.entry(name.clone()).or_insert(Category {
            access: access.into(),
            commands: HashMap::new(),
        });

        Ok(CategoryBuilder { name, category })
    }

    /// Resolves a dispatched `category.command` name. `None` means the peer
    /// gets `UNKNOWNCOMMAND`.
    pub fn lookup(&self, name: &str) -> Option<Resolved> {
        let (category, command) = codec::split_command(name)?;
        let category = self.categories.get(category)?;
        let record = category.commands.get(command)?;

        Some(Resolved {
            handler: record.handler.clone(),
            kind: record.kind,
            access: record.access.unwrap_or(category.access),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Builder returned by [`Registry::add_category`]; all registration happens
/// before the node starts.
pub struct CategoryBuilder<'a> {
    name: String,
    category: &'a mut Category,
}

impl CategoryBuilder<'_> {
    /// Registers a fire-and-forget command under this category.
    pub fn add_command<F>(&mut self, name: &str, handler: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.insert(name, CommandKind::Plain, None, Arc::new(handler))
    }

    /// Registers a request command: the peer must supply a reply tag and
    /// receives exactly one `REPLY` for it.
    pub fn add_request_command<F>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.insert(name, CommandKind::Request, None, Arc::new(handler))
    }

    /// Like [`add_command`](Self::add_command), with an access policy
    /// overriding the category default.
    pub fn add_command_with_access<F>(
        &mut self,
        name: &str,
        access: Access,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.insert(name, CommandKind::Plain, Some(access), Arc::new(handler))
    }

    /// Like [`add_request_command`](Self::add_request_command), with an
    /// access policy overriding the category default.
    pub fn add_request_command_with_access<F>(
        &mut self,
        name: &str,
        access: Access,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.insert(name, CommandKind::Request, Some(access), Arc::new(handler))
    }

    fn insert(
        &mut self,
        name: &str,
        kind: CommandKind,
        access: Option<Access>,
        handler: CommandHandler,
    ) -> Result<&mut Self, RegistryError> {
        if name.is_empty() || name.contains('.') {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        if self.category.commands.contains_key(name) {
            return Err(RegistryError::DuplicateCommand(format!(
                "{}.{}",
                self.name, name
            )));
        }

        self.category.commands.insert(
            name.to_string(),
            CommandRecord {
                handler,
                kind,
                access,
            },
        );

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::auth::AuthLevel;

    use super::*;

    fn noop(_: Message) {}

    #[test]
    fn registration_and_lookup() {
        let mut registry = Registry::default();
        registry
            .add_category("x", AuthLevel::Basic)
            .unwrap()
            .add_command("x", noop)
            .unwrap()
            .add_request_command("r", noop)
            .unwrap();

        let resolved = registry.lookup("x.x").unwrap();
        assert_eq!(resolved.kind, CommandKind::Plain);
        assert_eq!(resolved.access, Access::new(AuthLevel::Basic));

        let resolved = registry.lookup("x.r").unwrap();
        assert_eq!(resolved.kind, CommandKind::Request);

        assert!(registry.lookup("x.missing").is_none());
        assert!(registry.lookup("y.x").is_none());
        assert!(registry.lookup("x").is_none());
        assert!(registry.lookup("x.r.extra").is_none());
    }

    #[test]
    fn per_command_access_overrides_category_default() {
        let admin_only = Access {
            level: AuthLevel::Admin,
            remote_sn_only: false,
            local_sn_only: false,
        };

        let mut registry = Registry::default();
        registry
            .add_category("x", AuthLevel::None)
            .unwrap()
            .add_command_with_access("locked", admin_only, noop)
            .unwrap();

        assert_eq!(registry.lookup("x.locked").unwrap().access, admin_only);
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut registry = Registry::default();
        registry
            .add_category("x", AuthLevel::None)
            .unwrap()
            .add_command("x", noop)
            .unwrap();

        assert_eq!(
            registry
                .add_category("x", AuthLevel::None)
                .map(|_| ())
                .unwrap_err(),
            RegistryError::DuplicateCategory("x".to_string())
        );
    }

    #[test]
    fn separator_is_rejected_in_names() {
        let mut registry = Registry::default();
        assert_eq!(
            registry
                .add_category("a.b", AuthLevel::None)
                .map(|_| ())
                .unwrap_err(),
            RegistryError::InvalidName("a.b".to_string())
        );

        let mut builder = registry.add_category("x", AuthLevel::None).unwrap();
        assert_eq!(
            builder.add_command("a.b", noop).map(|_| ()).unwrap_err(),
            RegistryError::InvalidName("a.b".to_string())
        );
        assert_eq!(
            builder.add_command("", noop).map(|_| ()).unwrap_err(),
            RegistryError::InvalidName(String::new())
        );
    }

    #[test]
    fn duplicate_command_in_category() {
        let mut registry = Registry::default();
        let mut builder = registry.add_category("x", AuthLevel::None).unwrap();
        builder.add_command("x", noop).unwrap();

        assert_eq!(
            builder
                .add_request_command("x", noop)
                .map(|_| ())
                .unwrap_err(),
            RegistryError::DuplicateCommand("x.x".to_string())
        );
    }
}
