//! Per-user command aliases, stored under `aliases/<username>`.

use std::ops::ControlFlow;

use crate::core::request::Request;
use crate::core::store::{ALIASES_BUCKET, Direction, Store};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct AliasLedger {
    store: Store,
}

impl AliasLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stores `alias` as shorthand for `command_line` for one user.
    pub async fn set(&self, username: &str, alias: &str, command_line: &str) -> Result<()> {
        if alias.trim().is_empty() || command_line.trim().is_empty() {
            return Err(Error::Config("alias and command must not be empty".into()));
        }
        self.store
            .write(|tx| {
                let path: [&[u8]; 2] = [ALIASES_BUCKET, username.as_bytes()];
                tx.create_bucket_if_missing(&path)?;
                tx.put(&path, alias.as_bytes(), command_line.trim().as_bytes())
            })
            .await
    }

    pub async fn get(&self, username: &str, alias: &str) -> Result<Option<String>> {
        self.store
            .read(|tx| {
                let path: [&[u8]; 2] = [ALIASES_BUCKET, username.as_bytes()];
                Ok(tx
                    .get(&path, alias.as_bytes())?
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
            })
            .await
    }

    pub async fn remove(&self, username: &str, alias: &str) -> Result<bool> {
        self.store
            .write(|tx| {
                let path: [&[u8]; 2] = [ALIASES_BUCKET, username.as_bytes()];
                tx.delete(&path, alias.as_bytes())
            })
            .await
    }

    pub async fn list(&self, username: &str) -> Result<Vec<(String, String)>> {
        self.store
            .read(|tx| {
                let path: [&[u8]; 2] = [ALIASES_BUCKET, username.as_bytes()];
                let mut out = Vec::new();
                if !tx.bucket_exists(&path)? {
                    return Ok(out);
                }
                tx.scan(&path, Direction::Forward, |key, value| {
                    out.push((
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    ));
                    Ok(ControlFlow::Continue(()))
                })?;
                Ok(out)
            })
            .await
    }

    /// Rewrites `request` if its command is one of the user's aliases. The
    /// alias's own arguments go first, followed by the caller's.
    pub async fn expand(&self, request: &Request) -> Result<Option<Request>> {
        let Some(line) = self.get(&request.username, &request.command).await? else {
            return Ok(None);
        };
        let mut words = line.split_whitespace().map(str::to_string);
        let Some(command) = words.next() else {
            return Ok(None);
        };
        let mut expanded = request.clone();
        expanded.command = command;
        expanded.args = words.chain(request.args.iter().cloned()).collect();
        Ok(Some(expanded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aliases_are_per_user() {
        let aliases = AliasLedger::new(Store::in_memory());
        aliases.set("alice", "hi", "echo hello").await.unwrap();
        assert_eq!(
            aliases.get("alice", "hi").await.unwrap().as_deref(),
            Some("echo hello")
        );
        assert!(aliases.get("bob", "hi").await.unwrap().is_none());
        assert_eq!(aliases.list("alice").await.unwrap().len(), 1);
        assert!(aliases.list("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn look_alike_user_names_stay_apart() {
        let aliases = AliasLedger::new(Store::in_memory());
        aliases.set("a b", "hi", "echo secret").await.unwrap();
        assert!(aliases.get("612062", "hi").await.unwrap().is_none());
        assert!(aliases.list("612062").await.unwrap().is_empty());
        assert!(!aliases.remove("612062", "hi").await.unwrap());
        assert!(aliases.get("a b", "hi").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expand_prepends_alias_args() {
        let aliases = AliasLedger::new(Store::in_memory());
        aliases.set("alice", "hi", "echo hello").await.unwrap();
        let req = Request::new("hi", "alice").with_args(["world"]);
        let expanded = aliases.expand(&req).await.unwrap().unwrap();
        assert_eq!(expanded.command, "echo");
        assert_eq!(expanded.args, vec!["hello", "world"]);
        assert!(
            aliases
                .expand(&Request::new("echo", "alice"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn remove_alias() {
        let aliases = AliasLedger::new(Store::in_memory());
        aliases.set("alice", "hi", "echo hello").await.unwrap();
        assert!(aliases.remove("alice", "hi").await.unwrap());
        assert!(!aliases.remove("alice", "hi").await.unwrap());
        assert!(aliases.set("alice", "", "echo").await.is_err());
    }
}
