//! Decision engine boundary.
//!
//! The [`DecisionEngine`] trait decouples cycle orchestration from the actual
//! reasoning backend (by default a CLI such as `claude -p`). Tests use
//! scripted engines that return predetermined replies without spawning
//! processes. [`decide_with_policy`] wraps every call with timeout,
//! cancellation, bounded retries and a fixed fallback so callers always get a
//! terminal [`DecisionOutcome`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::config::DecisionConfig;
use crate::io::process::run_command;

/// Text of the outcome returned when the operator cancelled the call.
pub const ABORTED_TEXT: &str = "decision aborted by operator";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOptions {
    pub max_turns: u32,
    pub timeout: Duration,
    /// Extra attempts after a failed, timed out or empty reply.
    pub retries: u32,
    /// Prefer a cheaper/faster backend configuration.
    pub lightweight: bool,
    /// Session to continue, when the backend supports it.
    pub continue_session: Option<String>,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl DecisionOptions {
    pub fn from_config(cfg: &DecisionConfig) -> Self {
        Self {
            max_turns: cfg.max_turns,
            timeout: Duration::from_secs(cfg.timeout_secs),
            retries: cfg.retries,
            lightweight: false,
            continue_session: None,
            backoff: Duration::from_secs(2),
        }
    }

    /// Single-turn, lightweight variant used for quick choices.
    pub fn lightweight(self) -> Self {
        Self {
            max_turns: 1,
            lightweight: true,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionRequest {
    /// Short label for logs and cycle records (`discovery`, `choose`, ...).
    pub purpose: &'static str,
    pub prompt: String,
    pub options: DecisionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionReply {
    pub text: String,
    pub turns: u32,
    pub session_id: Option<String>,
}

/// Abstraction over reasoning backends.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Answer one request. Implementations should stop promptly once `cancel`
    /// fires; the policy wrapper stops waiting regardless.
    async fn decide(
        &self,
        request: &DecisionRequest,
        cancel: &CancellationToken,
    ) -> Result<DecisionReply>;
}

/// Terminal result of a policy-wrapped decision call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub text: String,
    /// Turns consumed across every attempt.
    pub turns: u32,
    pub session_id: Option<String>,
    pub aborted: bool,
    /// Every attempt failed and `text` is the configured fallback.
    pub fallback: bool,
}

impl DecisionOutcome {
    fn aborted(turns: u32) -> Self {
        Self {
            text: ABORTED_TEXT.to_string(),
            turns,
            session_id: None,
            aborted: true,
            fallback: false,
        }
    }

    /// A usable reply from the engine.
    pub fn is_answer(&self) -> bool {
        !self.aborted && !self.fallback
    }
}

/// Call `engine` with timeout, cancellation and bounded retries.
///
/// Never fails: transient errors and empty replies are retried, then replaced
/// by `fallback_text`; cancellation yields an aborted outcome.
#[instrument(skip_all, fields(purpose = request.purpose, retries = request.options.retries))]
pub async fn decide_with_policy(
    engine: &dyn DecisionEngine,
    request: &DecisionRequest,
    fallback_text: &str,
    cancel: &CancellationToken,
) -> DecisionOutcome {
    let options = &request.options;
    let mut turns = 0u32;

    for attempt in 0..=options.retries {
        if cancel.is_cancelled() {
            return DecisionOutcome::aborted(turns);
        }
        if attempt > 0 {
            tokio::select! {
                () = tokio::time::sleep(options.backoff) => {}
                () = cancel.cancelled() => return DecisionOutcome::aborted(turns),
            }
        }

        let result = tokio::select! {
            result = tokio::time::timeout(options.timeout, engine.decide(request, cancel)) => result,
            () = cancel.cancelled() => {
                info!(attempt, "decision cancelled");
                return DecisionOutcome::aborted(turns);
            }
        };

        match result {
            Ok(Ok(reply)) => {
                turns = turns.saturating_add(reply.turns);
                if reply.text.trim().is_empty() {
                    warn!(attempt, "decision engine returned empty reply");
                    continue;
                }
                debug!(attempt, turns, "decision reply received");
                return DecisionOutcome {
                    text: reply.text,
                    turns,
                    session_id: reply.session_id,
                    aborted: false,
                    fallback: false,
                };
            }
            Ok(Err(err)) => warn!(attempt, err = %err, "decision engine failed"),
            Err(_) => warn!(
                attempt,
                timeout_secs = options.timeout.as_secs(),
                "decision engine timed out"
            ),
        }
    }

    warn!("decision attempts exhausted; using fallback");
    DecisionOutcome {
        text: fallback_text.to_string(),
        turns,
        session_id: None,
        aborted: false,
        fallback: true,
    }
}

/// JSON shape printed by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct CliReply {
    result: Option<String>,
    num_turns: Option<u32>,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
}

/// Engine that runs the configured decision CLI with the prompt on stdin.
pub struct CommandDecisionEngine {
    config: DecisionConfig,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl CommandDecisionEngine {
    pub fn new(config: DecisionConfig, workdir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            output_limit_bytes,
        }
    }

    fn command(&self, options: &DecisionOptions) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("decision.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        if options.lightweight {
            cmd.args(&self.config.lightweight_args);
        }
        if !self.config.max_turns_flag.is_empty() {
            cmd.arg(&self.config.max_turns_flag)
                .arg(options.max_turns.to_string());
        }
        if let Some(session) = &options.continue_session
            && !self.config.resume_flag.is_empty()
        {
            cmd.arg(&self.config.resume_flag).arg(session);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl DecisionEngine for CommandDecisionEngine {
    #[instrument(skip_all, fields(purpose = request.purpose, lightweight = request.options.lightweight))]
    async fn decide(
        &self,
        request: &DecisionRequest,
        cancel: &CancellationToken,
    ) -> Result<DecisionReply> {
        let cmd = self.command(&request.options)?;
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            request.options.timeout,
            self.output_limit_bytes,
            cancel,
        )
        .await
        .context("run decision command")?;

        if !output.success() {
            return Err(anyhow!(output.failure_summary("decision command")));
        }
        parse_cli_output(&output.stdout_text())
    }
}

/// Interpret CLI stdout: the JSON envelope when present, plain text otherwise.
fn parse_cli_output(stdout: &str) -> Result<DecisionReply> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{')
        && let Ok(reply) = serde_json::from_str::<CliReply>(trimmed)
    {
        if reply.is_error {
            return Err(anyhow!(
                "decision command reported an error: {}",
                reply.result.unwrap_or_default()
            ));
        }
        return Ok(DecisionReply {
            text: reply.result.unwrap_or_default(),
            turns: reply.num_turns.unwrap_or(1),
            session_id: reply.session_id,
        });
    }
    Ok(DecisionReply {
        text: trimmed.to_string(),
        turns: 1,
        session_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedDecisionEngine, ScriptedReply};

    fn request() -> DecisionRequest {
        DecisionRequest {
            purpose: "test",
            prompt: "hello".to_string(),
            options: DecisionOptions {
                max_turns: 3,
                timeout: Duration::from_millis(200),
                retries: 2,
                lightweight: false,
                continue_session: None,
                backoff: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn first_good_reply_wins() {
        let engine = ScriptedDecisionEngine::new(vec![ScriptedReply::text("OBJECTIVE: ship")]);
        let outcome =
            decide_with_policy(&engine, &request(), "fallback", &CancellationToken::new()).await;
        assert!(outcome.is_answer());
        assert_eq!(outcome.text, "OBJECTIVE: ship");
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn empty_and_failed_replies_are_retried() {
        let engine = ScriptedDecisionEngine::new(vec![
            ScriptedReply::text("   "),
            ScriptedReply::error("backend unavailable"),
            ScriptedReply::text("done"),
        ]);
        let outcome =
            decide_with_policy(&engine, &request(), "fallback", &CancellationToken::new()).await;
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.turns, 2);
        assert_eq!(engine.calls().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_fallback() {
        let engine = ScriptedDecisionEngine::new(vec![
            ScriptedReply::error("boom"),
            ScriptedReply::Hang,
            ScriptedReply::text(""),
        ]);
        let outcome =
            decide_with_policy(&engine, &request(), "fallback", &CancellationToken::new()).await;
        assert!(outcome.fallback);
        assert!(!outcome.aborted);
        assert_eq!(outcome.text, "fallback");
    }

    #[tokio::test]
    async fn cancellation_yields_aborted_outcome() {
        let engine = ScriptedDecisionEngine::new(vec![ScriptedReply::Hang]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let mut req = request();
        req.options.timeout = Duration::from_secs(30);
        let outcome = decide_with_policy(&engine, &req, "fallback", &cancel).await;
        assert!(outcome.aborted);
        assert_eq!(outcome.text, ABORTED_TEXT);
    }

    #[test]
    fn parses_json_envelope() {
        let reply =
            parse_cli_output(r#"{"result":"TASK: a","num_turns":4,"session_id":"s-1"}"#)
                .expect("parse");
        assert_eq!(reply.text, "TASK: a");
        assert_eq!(reply.turns, 4);
        assert_eq!(reply.session_id.as_deref(), Some("s-1"));

        let err = parse_cli_output(r#"{"result":"rate limited","is_error":true}"#).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn plain_text_is_passed_through() {
        let reply = parse_cli_output("  just words\n").expect("parse");
        assert_eq!(reply.text, "just words");
        assert_eq!(reply.turns, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_engine_feeds_prompt_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = DecisionConfig {
            command: vec!["cat".to_string()],
            max_turns_flag: String::new(),
            ..DecisionConfig::default()
        };
        let engine = CommandDecisionEngine::new(config, temp.path(), 1024);
        let reply = engine
            .decide(&request(), &CancellationToken::new())
            .await
            .expect("decide");
        assert_eq!(reply.text, "hello");
    }
}
