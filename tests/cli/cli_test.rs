//! The `gatekeeper` binary: JSON on stdout, state in the configured database.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

use gatekeeper::types::{AgentRecord, AgentSpec, GovernanceConfig, GovernanceStatus, GovernedSpec};

use crate::support::{anatomy, bundle, sandbox_spec, POLICY_SET, SECRET};

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("gatekeeper.toml");
        std::fs::write(
            &config,
            "[paths]\ndatabase = \"gatekeeper.db\"\nlogs_dir = \"logs\"\n",
        )
        .expect("write config");
        Self { dir, config }
    }

    fn write_json(&self, name: &str, value: &impl serde::Serialize) -> PathBuf {
        let path = self.dir.path().join(name);
        let text = serde_json::to_string_pretty(value).expect("serialize");
        std::fs::write(&path, text).expect("write file");
        path
    }

    fn run(&self, args: &[&str]) -> Value {
        let output = self
            .command()
            .args(args)
            .output()
            .expect("binary runs");
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("json on stdout")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("gatekeeper").expect("binary built");
        cmd.arg("--config")
            .arg(&self.config)
            .env("GATEKEEPER_SIGNING_SECRET", BASE64.encode(SECRET))
            .env_remove("RUST_LOG");
        cmd
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

fn fresh_sandbox(id: &str) -> AgentRecord {
    AgentRecord::new_sandbox(id, sandbox_spec(), Utc::now())
}

#[test]
fn keygen_prints_a_usable_secret() {
    let ws = Workspace::new();
    let out = ws.run(&["keygen"]);
    let secret = out["secret"].as_str().expect("secret string");
    let bytes = BASE64.decode(secret).expect("base64");
    assert!(bytes.len() >= 32);
    assert_ne!(ws.run(&["keygen"])["secret"], out["secret"]);
}

#[test]
fn spec_hash_accepts_a_record_file() {
    let ws = Workspace::new();
    let record = ws.write_json("agent.json", &fresh_sandbox("agent-1"));
    let out = ws.run(&["spec-hash", arg(&record)]);
    let hash = out["spec_hash"].as_str().expect("hash string");
    assert!(hash.starts_with("sha256:"));

    // Same spec, different metadata, same hash.
    let again = ws.write_json("agent-2.json", &fresh_sandbox("agent-2"));
    assert_eq!(ws.run(&["spec-hash", arg(&again)])["spec_hash"], out["spec_hash"]);
}

#[test]
fn registered_sandbox_is_admitted() {
    let ws = Workspace::new();
    let record = ws.write_json("agent.json", &fresh_sandbox("agent-1"));
    let registered = ws.run(&["register", arg(&record)]);
    assert_eq!(registered["registered"], "agent-1");
    assert_eq!(registered["status"], "SANDBOX");

    let decision = ws.run(&["check", "agent-1"]);
    assert_eq!(decision["allow"], true);
    assert_eq!(decision["restrict"], false);
    assert!(ws.path("gatekeeper.db").exists());
}

#[test]
fn register_ignores_submitted_status_and_rejects_governed_specs() {
    let ws = Workspace::new();
    let mut forged = fresh_sandbox("agent-1");
    forged.status = GovernanceStatus::GovernedValid;
    let path = ws.write_json("forged.json", &forged);
    assert_eq!(ws.run(&["register", arg(&path)])["status"], "SANDBOX");

    let mut governed = fresh_sandbox("agent-2");
    governed.spec = AgentSpec::Governed(GovernedSpec {
        anatomy: anatomy(),
        governance: GovernanceConfig {
            policy_set: POLICY_SET.to_owned(),
            capabilities: Default::default(),
            economics: Default::default(),
            proof: None,
        },
    });
    let governed = ws.write_json("governed.json", &governed);
    let output = ws
        .command()
        .args(["register", arg(&governed)])
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn unknown_agent_is_denied() {
    let ws = Workspace::new();
    let decision = ws.run(&["check", "ghost"]);
    assert_eq!(decision["deny"], true);
    assert_eq!(decision["error_codes"][0], "AGENT_NOT_FOUND");
}

#[test]
fn reload_promote_and_check_share_the_database() {
    let ws = Workspace::new();
    let policy = ws.write_json("bundle.json", &bundle(1000.0));
    let first = ws.run(&["reload", POLICY_SET, arg(&policy)]);
    assert_eq!(first["old_hash"], "none");
    assert_eq!(first["version"], 1);

    let record = ws.write_json("agent.json", &fresh_sandbox("agent-1"));
    ws.run(&["register", arg(&record)]);
    let request = ws.write_json(
        "request.json",
        &serde_json::json!({
            "policy_set": POLICY_SET,
            "capabilities": ["search_knowledge"],
            "economics": { "monthly_budget_usd": 250.0 },
        }),
    );
    let promoted = ws.run(&["promote", "agent-1", arg(&request), "--actor", "alice"]);
    assert_eq!(promoted["approved"], true);
    assert!(promoted["proof"]["signature"].is_object());

    // A fresh process restores the registry and accepts the proof.
    let decision = ws.run(&["check", "agent-1"]);
    assert_eq!(decision["allow"], true, "decision: {decision}");

    let scan = ws.run(&["scan"]);
    assert_eq!(scan["total_scanned"], 1);
    assert_eq!(scan["total_drifted"], 0);
}

#[test]
fn missing_secret_fails_without_output() {
    let ws = Workspace::new();
    let output = ws
        .command()
        .env_remove("GATEKEEPER_SIGNING_SECRET")
        .args(["check", "agent-1"])
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("signing"));
}
