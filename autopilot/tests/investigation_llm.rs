//! Investigation tests for the external decision CLI.
//!
//! These tests call the configured decision command for real and are
//! excluded from regular CI runs because they require the CLI to be
//! installed and authenticated.
//!
//! Run with: `cargo test -p autopilot --test investigation_llm -- --ignored`

use std::time::Duration;

use autopilot::core::fields::Fields;
use autopilot::io::config::DecisionConfig;
use autopilot::io::decision::{
    CommandDecisionEngine, DecisionOptions, DecisionRequest, decide_with_policy,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires the decision CLI and credentials"]
async fn lightweight_choice_reply_follows_label_grammar() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = DecisionConfig::default();
    let fallback = config.fallback_text.clone();
    let engine = CommandDecisionEngine::new(config.clone(), temp.path(), 100_000);
    let request = DecisionRequest {
        purpose: "choose",
        prompt: "Pick one task. Reply with exactly:\nTASK: <id>\nREASON: <one sentence>\n\nCandidates:\n- draft (priority 100): Draft the report\n- publish (priority 99): Publish the report".to_string(),
        options: DecisionOptions {
            timeout: Duration::from_secs(120),
            ..DecisionOptions::from_config(&config).lightweight()
        },
    };

    let outcome = decide_with_policy(&engine, &request, &fallback, &CancellationToken::new()).await;

    assert!(outcome.is_answer(), "no answer: {}", outcome.text);
    let fields = Fields::parse(&outcome.text);
    assert!(matches!(fields.get("TASK"), Some("draft" | "publish")));
    assert!(outcome.turns >= 1);
}
