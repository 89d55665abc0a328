//! End-to-end runs of the mentorloop binary with shell-script agents

#![cfg(unix)]

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const AGENT_SCRIPT: &str = r#"cat > /dev/null
case "$MENTORLOOP_STAGE" in
  intent_route) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"intent_route","output":{"topic":"algebra"}}}' ;;
  normalize) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"normalize","output":{"text":"x + 1 = 2"}}}' ;;
  parse) printf '{"status":"ok","confidence":%s,"payload":{"stage":"parse","output":{"expression":"x + 1 = 2"}}}\n' "${PARSE_CONFIDENCE:-0.95}" ;;
  solve) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"solve","output":{"final_answer":"x = 1"}}}' ;;
  explain) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"explain","output":{"text":"Subtract 1 from both sides."}}}' ;;
  verify) echo '{"status":"ok","confidence":0.95,"payload":{"stage":"verify","output":{"verdict":"correct"}}}' ;;
  evaluate) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"evaluate","output":{"quality_score":0.9}}}' ;;
  guardrail) echo '{"status":"ok","confidence":0.9,"payload":{"stage":"guardrail","output":{"passed":true}}}' ;;
  *) exit 42 ;;
esac
"#;

const STAGES: [&str; 8] = [
    "intent_route",
    "normalize",
    "parse",
    "solve",
    "explain",
    "verify",
    "evaluate",
    "guardrail",
];

/// Temporary config, data directory and pipeline
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(parse_confidence: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, AGENT_SCRIPT).unwrap();

        let mut pipeline = String::from("name: test-tutor\ndefaults:\n  timeout_seconds: 10\n  env:\n");
        pipeline.push_str(&format!("    PARSE_CONFIDENCE: \"{}\"\nstages:\n", parse_confidence));
        for stage in STAGES {
            pipeline.push_str(&format!(
                "  {}:\n    command: sh {}\n",
                stage,
                script.display()
            ));
        }
        std::fs::write(dir.path().join("pipeline.yaml"), pipeline).unwrap();

        let config = format!(
            "log_level = \"error\"\ndata_dir = \"{}\"\npipeline_file = \"{}\"\n",
            dir.path().join("data").display(),
            dir.path().join("pipeline.yaml").display()
        );
        std::fs::write(dir.path().join("config.toml"), config).unwrap();

        Self { dir }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn run(&self, args: &[&str]) -> Value {
        let output = Command::new(env!("CARGO_BIN_EXE_mentorloop"))
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .output()
            .expect("Failed to run mentorloop");

        assert!(
            output.status.success(),
            "mentorloop {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// A confident pipeline solves the problem and records it in the session
#[test]
fn test_solve_completes() {
    let ws = Workspace::new("0.95");

    let result = ws.run(&["solve", "x + 1 = 2", "--session", "alice", "--json"]);
    assert_eq!(result["status"], "completed");
    assert_eq!(result["answer"], "x = 1");

    let run_id = result["run_id"].as_str().unwrap().to_string();
    let trace = ws.run(&["trace", &run_id, "--json"]);
    assert!(trace.as_array().unwrap().len() >= 9);

    let history = ws.run(&["history", "alice", "--json"]);
    assert_eq!(history["summary"]["total_runs"], 1);
    assert_eq!(history["summary"]["completed"], 1);

    let metrics = ws.run(&["metrics", "--json"]);
    assert_eq!(metrics["run_count"], 1);
    assert!(ws.path().join("data").join("runs.json").exists());
}

/// A low-confidence parse waits for review and finishes after acceptance
#[test]
fn test_review_accept_resumes_run() {
    let ws = Workspace::new("0.3");

    let result = ws.run(&["solve", "x + 1 = 2", "--json"]);
    assert_eq!(result["status"], "awaiting_review");
    let handle = result["review_handle"].as_str().unwrap().to_string();

    let reviews = ws.run(&["reviews", "--json"]);
    assert_eq!(reviews.as_array().unwrap().len(), 1);
    assert_eq!(reviews[0]["handle"], handle.as_str());
    assert_eq!(reviews[0]["stage"], "parse");

    let resumed = ws.run(&["review", "accept", &handle, "--json"]);
    assert_eq!(resumed["status"], "completed");

    let reviews = ws.run(&["reviews", "--json"]);
    assert!(reviews.as_array().unwrap().is_empty());
}

/// A suspended run can be cancelled from the command line
#[test]
fn test_cancel_suspended_run() {
    let ws = Workspace::new("0.3");

    let result = ws.run(&["solve", "x + 1 = 2", "--json"]);
    let run_id = result["run_id"].as_str().unwrap().to_string();

    let cancelled = ws.run(&["cancel", &run_id, "--reason", "wrong problem", "--json"]);
    assert_eq!(cancelled["stage"], "failed");
    assert_eq!(cancelled["failure"]["kind"], "cancelled");

    let status = ws.run(&["status", &run_id, "--json"]);
    assert_eq!(status["status"], "cancelled");
}

/// The pipeline used by these tests passes validation
#[test]
fn test_validate_pipeline() {
    let ws = Workspace::new("0.95");
    let result = ws.run(&["validate", "--json"]);
    assert_eq!(result["valid"], true);
    assert_eq!(result["pipeline"], "test-tutor");
}
