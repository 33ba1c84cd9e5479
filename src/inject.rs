//! Secret injection into exactly one child process.
//!
//! The injector validates the grant, builds the child environment (explicit
//! injection plus full-value `2k://` placeholder substitution), spawns with
//! piped stdio, streams both pipes through redactors, and enforces a run
//! timer and a per-pipe raw-byte cap. Whatever happens after preflight, the
//! grant is consumed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::InjectError;
use crate::grant::{Grant, GrantManager};
use crate::redact::Redactor;
use crate::store::SecretStore;

/// Raw (pre-redaction) byte cap per pipe.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// An env var whose whole value has this shape is substituted; partial
/// occurrences are left alone.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^2k://(.+)$").expect("valid placeholder pattern"));

/// Options for one injection run.
#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// Env var to receive the grant's first secret verbatim.
    pub env_var_name: Option<String>,
    pub timeout_ms: u64,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            env_var_name: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Redacted outcome of the child run. `exit_code` is `None` when the child
/// was killed by a signal; callers map that to a non-zero status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns one child per valid grant with secrets in its environment.
pub struct Injector {
    store: Arc<SecretStore>,
    grants: Arc<GrantManager>,
}

impl Injector {
    pub fn new(store: Arc<SecretStore>, grants: Arc<GrantManager>) -> Self {
        Self { store, grants }
    }

    /// Run `command` with the grant's secrets injected. Preflight failures
    /// spawn nothing; past preflight the grant is marked used on every exit
    /// path, and a failure of that bookkeeping never masks the primary
    /// outcome.
    pub async fn inject(
        &self,
        grant_id: Uuid,
        command: &[String],
        opts: InjectOptions,
    ) -> Result<InjectOutput, InjectError> {
        if command.is_empty() {
            return Err(InjectError::EmptyCommand);
        }
        if !self.grants.validate_grant(grant_id) {
            return Err(InjectError::GrantNotValid { id: grant_id });
        }
        let grant = self
            .grants
            .get_grant(grant_id)
            .ok_or(InjectError::GrantNotFound { id: grant_id })?;

        let result = self.run(&grant, command, &opts).await;

        if let Err(e) = self.grants.mark_used(grant_id) {
            tracing::debug!(grant = %grant_id, error = %e, "mark_used after injection failed");
        }
        result
    }

    /// Build the child environment from a copy of the parent's: explicit
    /// injection first, then full-value placeholder substitution over every
    /// var. A placeholder resolving outside the grant aborts before spawn.
    fn build_env(
        &self,
        grant: &Grant,
        env_var_name: Option<&str>,
        mut env: HashMap<String, String>,
    ) -> Result<HashMap<String, String>, InjectError> {
        if let Some(name) = env_var_name {
            let value = self.store.get_value(grant.secret_uuids[0])?;
            env.insert(name.to_string(), value);
        }

        for (name, value) in env.iter_mut() {
            let Some(caps) = PLACEHOLDER.captures(value) else {
                continue;
            };
            let target = caps.get(1).expect("placeholder capture").as_str();
            let resolved = self.store.resolve_ref(target)?;
            if !grant.secret_uuids.contains(&resolved.uuid) {
                return Err(InjectError::PlaceholderOutOfScope {
                    var: name.clone(),
                    placeholder: value.clone(),
                    uuid: resolved.uuid,
                });
            }
            *value = resolved.value;
        }
        Ok(env)
    }

    async fn run(
        &self,
        grant: &Grant,
        command: &[String],
        opts: &InjectOptions,
    ) -> Result<InjectOutput, InjectError> {
        let env = self.build_env(grant, opts.env_var_name.as_deref(), std::env::vars().collect())?;

        // Everything the grant covers feeds the redactors; secrets that no
        // longer resolve are skipped.
        let secrets: Vec<String> = grant
            .secret_uuids
            .iter()
            .filter_map(|u| self.store.get_value(*u).ok())
            .collect();

        let program = &command[0];
        let mut child = Command::new(program)
            .args(&command[1..])
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InjectError::SpawnFailure {
                command: program.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(grant = %grant.id, program = %program, "child spawned");

        let stdout_pipe = child.stdout.take().ok_or_else(|| InjectError::SpawnFailure {
            command: program.clone(),
            reason: "stdout pipe unavailable".to_string(),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| InjectError::SpawnFailure {
            command: program.clone(),
            reason: "stderr pipe unavailable".to_string(),
        })?;

        // First pipe to blow the cap records its name and wakes the select.
        let capped: Arc<OnceLock<&'static str>> = Arc::new(OnceLock::new());
        let cap_signal = Arc::new(Notify::new());

        let stdout_task = tokio::spawn(drain_redacted(
            stdout_pipe,
            Redactor::new(&secrets),
            Arc::clone(&capped),
            Arc::clone(&cap_signal),
            "stdout",
        ));
        let stderr_task = tokio::spawn(drain_redacted(
            stderr_pipe,
            Redactor::new(&secrets),
            Arc::clone(&capped),
            Arc::clone(&cap_signal),
            "stderr",
        ));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| InjectError::SpawnFailure {
                command: program.clone(),
                reason: e.to_string(),
            })?,
            _ = cap_signal.notified() => {
                let _ = child.start_kill();
                return Err(InjectError::BufferExceeded {
                    stream: capped.get().copied().unwrap_or("output"),
                    limit: MAX_BUFFER_BYTES,
                });
            }
            _ = tokio::time::sleep(Duration::from_millis(opts.timeout_ms)) => {
                let _ = child.start_kill();
                return Err(InjectError::Timeout { timeout_ms: opts.timeout_ms });
            }
        };

        let stdout = join_drain(stdout_task, program).await?;
        let stderr = join_drain(stderr_task, program).await?;

        // The child may have raced its own exit against the cap; the drains
        // have settled by now, so this check is final.
        if let Some(stream) = capped.get() {
            return Err(InjectError::BufferExceeded {
                stream,
                limit: MAX_BUFFER_BYTES,
            });
        }

        Ok(InjectOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn join_drain(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    program: &str,
) -> Result<Vec<u8>, InjectError> {
    task.await
        .map_err(|e| InjectError::SpawnFailure {
            command: program.to_string(),
            reason: format!("output task failed: {e}"),
        })?
        .map_err(|e| InjectError::SpawnFailure {
            command: program.to_string(),
            reason: format!("pipe read failed: {e}"),
        })
}

/// Read one pipe to EOF through a redactor, counting raw bytes. On cap
/// overflow: record the pipe name, wake the parent, stop reading.
async fn drain_redacted<R: AsyncRead + Unpin>(
    mut reader: R,
    mut redactor: Redactor,
    capped: Arc<OnceLock<&'static str>>,
    cap_signal: Arc<Notify>,
    stream: &'static str,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut raw_bytes: usize = 0;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw_bytes += n;
        if raw_bytes > MAX_BUFFER_BYTES {
            let _ = capped.set(stream);
            cap_signal.notify_one();
            return Ok(out);
        }
        out.extend(redactor.push(&buf[..n]));
    }

    out.extend(redactor.finish());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    use crate::request::{AccessRequest, RequestStatus};

    struct Fixture {
        _dir: TempDir,
        store: Arc<SecretStore>,
        grants: Arc<GrantManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                store: Arc::new(SecretStore::new(dir.path().join("secrets.json"))),
                grants: Arc::new(GrantManager::new()),
                _dir: dir,
            }
        }

        fn injector(&self) -> Injector {
            Injector::new(Arc::clone(&self.store), Arc::clone(&self.grants))
        }

        /// Seed a secret and issue a fresh grant covering it.
        fn grant_for(&self, slug: &str, value: &str) -> (Uuid, Grant) {
            let uuid = self.store.add(slug, value, vec![]).unwrap();
            (uuid, self.grant_over(vec![uuid]))
        }

        fn grant_over(&self, uuids: Vec<Uuid>) -> Grant {
            let mut req = AccessRequest::new(uuids, "test", "T-0", Some(60)).unwrap();
            req.status = RequestStatus::Approved;
            self.grants.create_grant(&req).unwrap()
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let fx = Fixture::new();
        let err = fx.injector().inject(Uuid::new_v4(), &[], InjectOptions::default()).await;
        assert!(matches!(err, Err(InjectError::EmptyCommand)));
    }

    #[tokio::test]
    async fn invalid_grant_spawns_nothing() {
        let fx = Fixture::new();
        let past = Utc::now() - ChronoDuration::seconds(120);
        let grant = Grant {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            secret_uuids: vec![Uuid::new_v4()],
            granted_at: past,
            expires_at: past + ChronoDuration::seconds(30),
            used: false,
            revoked_at: None,
        };
        let id = grant.id;
        fx.grants.insert_for_test(grant);

        let err = fx
            .injector()
            .inject(id, &sh("echo should-not-run"), InjectOptions::default())
            .await;
        assert!(matches!(err, Err(InjectError::GrantNotValid { .. })));
    }

    #[tokio::test]
    async fn injects_env_var_and_redacts_output() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("deploy-key", "super-secret-value");

        let out = fx
            .injector()
            .inject(
                grant.id,
                &sh("echo \"$KEY\""),
                InjectOptions {
                    env_var_name: Some("KEY".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "[REDACTED]\n");
        assert_eq!(out.stderr, "");

        // Single use: the grant is consumed.
        assert!(!fx.grants.validate_grant(grant.id));
        assert!(fx.grants.get_grant(grant.id).unwrap().used);
    }

    #[tokio::test]
    async fn consumed_grant_cannot_inject_twice() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("once-key", "v");
        let injector = fx.injector();

        injector
            .inject(grant.id, &sh("true"), InjectOptions::default())
            .await
            .unwrap();
        let err = injector
            .inject(grant.id, &sh("true"), InjectOptions::default())
            .await;
        assert!(matches!(err, Err(InjectError::GrantNotValid { .. })));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_forwarded() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("exit-key", "v");

        let out = fx
            .injector()
            .inject(grant.id, &sh("exit 3"), InjectOptions::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_still_consumes_the_grant() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("slow-key", "v");

        let err = fx
            .injector()
            .inject(
                grant.id,
                &sh("sleep 5"),
                InjectOptions {
                    timeout_ms: 100,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(InjectError::Timeout { timeout_ms: 100 })));
        assert!(fx.grants.get_grant(grant.id).unwrap().used);
    }

    #[tokio::test]
    async fn buffer_cap_kills_the_child() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("noisy-key", "v");

        let err = fx
            .injector()
            .inject(
                grant.id,
                &sh("head -c 11000000 /dev/zero"),
                InjectOptions::default(),
            )
            .await;
        assert!(matches!(
            err,
            Err(InjectError::BufferExceeded { stream: "stdout", .. })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_the_program() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("ghost-key", "v");

        let err = fx
            .injector()
            .inject(
                grant.id,
                &["definitely-not-a-real-binary-2kc".to_string()],
                InjectOptions::default(),
            )
            .await;
        match err {
            Err(InjectError::SpawnFailure { command, .. }) => {
                assert_eq!(command, "definitely-not-a-real-binary-2kc");
            }
            other => panic!("expected SpawnFailure, got {other:?}"),
        }
        // Spawn failure still consumes the grant.
        assert!(fx.grants.get_grant(grant.id).unwrap().used);
    }

    #[tokio::test]
    async fn stderr_is_redacted_independently() {
        let fx = Fixture::new();
        let (_uuid, grant) = fx.grant_for("err-key", "leak-me");

        let out = fx
            .injector()
            .inject(
                grant.id,
                &sh("echo \"$KEY\" 1>&2"),
                InjectOptions {
                    env_var_name: Some("KEY".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "[REDACTED]\n");
    }

    mod build_env {
        use super::*;

        fn base_env() -> HashMap<String, String> {
            HashMap::from([("PATH".to_string(), "/usr/bin".to_string())])
        }

        #[test]
        fn explicit_injection_uses_the_first_grant_secret() {
            let fx = Fixture::new();
            let first = fx.store.add("first-key", "first-value", vec![]).unwrap();
            let second = fx.store.add("second-key", "second-value", vec![]).unwrap();
            let grant = fx.grant_over(vec![first, second]);

            let env = fx
                .injector()
                .build_env(&grant, Some("TOKEN"), base_env())
                .unwrap();
            assert_eq!(env["TOKEN"], "first-value");
            assert_eq!(env["PATH"], "/usr/bin");
        }

        #[test]
        fn full_value_placeholder_is_substituted() {
            let fx = Fixture::new();
            let (uuid, grant) = fx.grant_for("db-pass", "hunter2");

            let mut env = base_env();
            env.insert("BY_REF".to_string(), "2k://db-pass".to_string());
            env.insert("BY_UUID".to_string(), format!("2k://{uuid}"));
            env.insert("PARTIAL".to_string(), "prefix 2k://db-pass".to_string());

            let env = fx.injector().build_env(&grant, None, env).unwrap();
            assert_eq!(env["BY_REF"], "hunter2");
            assert_eq!(env["BY_UUID"], "hunter2");
            // Substring placeholders are not substituted.
            assert_eq!(env["PARTIAL"], "prefix 2k://db-pass");
        }

        #[test]
        fn placeholder_outside_the_grant_aborts() {
            let fx = Fixture::new();
            let (_a, grant) = fx.grant_for("in-scope", "a");
            let out_uuid = fx.store.add("out-of-scope", "b", vec![]).unwrap();

            let mut env = base_env();
            env.insert("FOO".to_string(), "2k://out-of-scope".to_string());

            let err = fx.injector().build_env(&grant, None, env).unwrap_err();
            match err {
                InjectError::PlaceholderOutOfScope { var, placeholder, uuid } => {
                    assert_eq!(var, "FOO");
                    assert_eq!(placeholder, "2k://out-of-scope");
                    assert_eq!(uuid, out_uuid);
                }
                other => panic!("expected PlaceholderOutOfScope, got {other:?}"),
            }
        }

        #[test]
        fn unresolvable_placeholder_is_an_error() {
            let fx = Fixture::new();
            let (_a, grant) = fx.grant_for("real-key", "v");

            let mut env = base_env();
            env.insert("FOO".to_string(), "2k://no-such-slug".to_string());

            let err = fx.injector().build_env(&grant, None, env).unwrap_err();
            assert!(matches!(err, InjectError::Store(_)), "{err:?}");
        }
    }
}
