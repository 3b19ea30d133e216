//! The turn loop.
//!
//! Each turn renders a prompt from the run state, asks the reasoner for the
//! next command(s), dispatches them in order and records the results. The run
//! ends on the first command that gets root, after `max_turns` turns, or on
//! the first unhandled error.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::capabilities::{CapabilityDispatcher, DispatchOutcome};
use crate::core::budget::{history_budget, trim_front};
use crate::core::failures::FailureTracker;
use crate::core::history::{HistoryMode, HistoryStore};
use crate::core::text::{extract_tagged_commands, fix_command_output};
use crate::core::types::{AgentPhase, Round, RunState, Termination};
use crate::errors::MissingCommandBlockError;
use crate::io::config::PrivescConfig;
use crate::io::prompt::{NextCommandPrompt, PromptEngine, guidance_block};
use crate::io::reasoner::{Completion, Reasoner};
use crate::io::run_log::{CommandLog, RoundLog, RunLog, RunSummary};
use crate::io::transport::Transport;

/// Knobs for one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub max_turns: u32,
    pub history: HistoryMode,
    pub enable_cot: bool,
    pub enable_update_state: bool,
    pub enable_explanation: bool,
    pub enable_structured_guidance: bool,
    /// Already resolved for the target host.
    pub hint: Option<String>,
    pub system: String,
    pub target_user: String,
    pub safety_margin: usize,
    pub strategy_overhead_tokens: usize,
    pub log_dir: Option<PathBuf>,
}

impl AgentSettings {
    pub fn from_config(config: &PrivescConfig, hint: Option<String>) -> Self {
        Self {
            max_turns: config.agent.max_turns,
            history: config.agent.history,
            enable_cot: config.agent.enable_cot,
            enable_update_state: config.agent.enable_update_state,
            enable_explanation: config.agent.enable_explanation,
            enable_structured_guidance: config.agent.enable_structured_guidance,
            hint,
            system: config.target.system.clone(),
            target_user: config.target.target_user.clone(),
            safety_margin: config.agent.safety_margin,
            strategy_overhead_tokens: config.agent.strategy_overhead_tokens,
            log_dir: config.agent.log_dir.clone(),
        }
    }
}

/// Why `run` stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// A command reached the target identity.
    GotRoot { turn: u32, command: String },
    /// `max_turns` turns ran without success.
    Exhausted { max_turns: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: Option<String>,
    pub turns_executed: u32,
    pub stop: RunStop,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self.stop, RunStop::GotRoot { .. })
    }

    pub fn termination(&self) -> Termination {
        match self.stop {
            RunStop::GotRoot { .. } => Termination::Succeeded,
            RunStop::Exhausted { .. } => Termination::Exhausted,
        }
    }
}

/// One dispatched command inside a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub command: String,
    pub outcome: DispatchOutcome,
}

/// Everything a turn did, handed to the progress callback.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn: u32,
    pub completion: Completion,
    pub commands: Vec<ExecutedCommand>,
    pub got_root: bool,
}

pub struct Agent<T: Transport, R: Reasoner> {
    dispatcher: CapabilityDispatcher<T>,
    reasoner: R,
    prompts: PromptEngine,
    settings: AgentSettings,
    history: HistoryStore,
    failures: FailureTracker,
    state: RunState,
    phase: AgentPhase,
    rounds: Vec<Round>,
    capability_block: String,
    guidance: Option<String>,
    history_budget: usize,
    run_log: Option<RunLog>,
}

impl<T: Transport, R: Reasoner> Agent<T, R> {
    /// Set up a run: capabilities must already be registered on `dispatcher`.
    pub fn new(
        dispatcher: CapabilityDispatcher<T>,
        reasoner: R,
        settings: AgentSettings,
    ) -> Result<Self> {
        if settings.max_turns == 0 {
            return Err(anyhow!("max_turns must be > 0"));
        }
        let prompts = PromptEngine::new()?;
        let capability_block = dispatcher.capability_block();
        let guidance = guidance_block(settings.hint.as_deref(), settings.enable_structured_guidance);
        let static_tokens = reasoner.count_tokens(prompts.next_command_source())
            + reasoner.count_tokens(&capability_block)
            + guidance
                .as_deref()
                .map_or(0, |text| reasoner.count_tokens(text));
        let history_budget = history_budget(
            reasoner.context_size(),
            settings.safety_margin,
            static_tokens,
            settings.strategy_overhead_tokens,
        );
        if let Some(hint) = &settings.hint {
            info!(hint = %hint, "using hint");
        }
        let run_log = settings
            .log_dir
            .as_deref()
            .map(RunLog::create)
            .transpose()
            .context("create run log")?;

        debug!(static_tokens, history_budget, "agent initialised");
        Ok(Self {
            history: HistoryStore::new(settings.history, history_budget),
            failures: FailureTracker::default(),
            state: RunState::new(settings.max_turns),
            phase: AgentPhase::Init,
            rounds: Vec::new(),
            dispatcher,
            reasoner,
            prompts,
            settings,
            capability_block,
            guidance,
            history_budget,
            run_log,
        })
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn history_budget(&self) -> usize {
        self.history_budget
    }

    pub fn run_log(&self) -> Option<&RunLog> {
        self.run_log.as_ref()
    }

    pub fn dispatcher(&self) -> &CapabilityDispatcher<T> {
        &self.dispatcher
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    /// Run turns until root, exhaustion or an error.
    ///
    /// `on_turn` is called after every completed turn. The session is closed
    /// before returning, whatever the outcome.
    #[instrument(skip_all, fields(max_turns = self.settings.max_turns))]
    pub fn run<F: FnMut(&TurnReport)>(&mut self, mut on_turn: F) -> Result<RunOutcome> {
        if self.phase != AgentPhase::Init {
            return Err(anyhow!("agent already ran (phase {:?})", self.phase));
        }
        self.phase = AgentPhase::Running;

        let result = self.run_turns(&mut on_turn);
        if let Err(err) = self.dispatcher.close() {
            warn!(err = %format!("{err:#}"), "failed to close session");
        }

        match result {
            Ok(outcome) => {
                self.phase = match outcome.stop {
                    RunStop::GotRoot { .. } => AgentPhase::Succeeded,
                    RunStop::Exhausted { .. } => AgentPhase::Exhausted,
                };
                match &outcome.stop {
                    RunStop::GotRoot { turn, command } => {
                        info!(turn, command = %command, "goal reached");
                    }
                    RunStop::Exhausted { max_turns } => {
                        info!(max_turns, "maximum turn number reached");
                    }
                }
                self.write_summary(outcome.termination(), outcome.turns_executed, None)?;
                Ok(outcome)
            }
            Err(err) => {
                self.phase = AgentPhase::Failed;
                let turns = self.state.turn.saturating_sub(1);
                error!(turn = self.state.turn, err = %format!("{err:#}"), "run failed");
                if let Err(log_err) =
                    self.write_summary(Termination::Failed, turns, Some(format!("{err:?}")))
                {
                    warn!(err = %format!("{log_err:#}"), "failed to write run summary");
                }
                Err(err)
            }
        }
    }

    fn run_turns<F: FnMut(&TurnReport)>(&mut self, on_turn: &mut F) -> Result<RunOutcome> {
        let run_id = self.run_log.as_ref().map(|log| log.run_id().to_string());
        while !self.state.is_exhausted() {
            let turn = self.state.turn;
            let report = {
                let _span = info_span!("turn", turn, max_turns = self.state.max_turns).entered();
                info!("starting turn {turn} of {}", self.state.max_turns);
                self.run_turn(turn)
                    .with_context(|| format!("turn {turn} failed"))?
            };

            self.state.turn += 1;
            self.state.bump();
            on_turn(&report);

            if report.got_root {
                self.state.success = true;
                let command = report
                    .commands
                    .iter()
                    .find(|c| c.outcome.got_root())
                    .map(|c| c.command.clone())
                    .unwrap_or_default();
                return Ok(RunOutcome {
                    run_id,
                    turns_executed: turn,
                    stop: RunStop::GotRoot { turn, command },
                });
            }
        }

        Ok(RunOutcome {
            run_id,
            turns_executed: self.state.max_turns,
            stop: RunStop::Exhausted {
                max_turns: self.state.max_turns,
            },
        })
    }

    fn run_turn(&mut self, turn: u32) -> Result<TurnReport> {
        self.state.failed_vectors = self.failures.failed_vectors();
        let prompt = self.render_prompt()?;
        let completion = self
            .reasoner
            .complete(&prompt)
            .context("ask reasoner for next command")?;
        let commands = self.postprocess(&completion.text)?;
        debug!(count = commands.len(), "commands extracted");

        let mut executed = Vec::new();
        let mut got_root = false;
        for command in commands {
            let outcome = self.dispatcher.dispatch(&command)?;
            let output = outcome.output().to_string();

            self.history.append(&self.reasoner, &command, &output);
            if let Some(vector) = self.failures.record(&command, &output) {
                info!(vector = %vector, "approach keeps failing");
            }
            self.rounds.push(Round {
                index: turn,
                command: command.clone(),
                result: output.clone(),
                got_root: outcome.got_root(),
            });

            if self.settings.enable_update_state {
                self.update_facts(&command, &output)?;
            }
            if self.settings.enable_explanation {
                self.analyze(&command, &output)?;
            }

            got_root = outcome.got_root();
            executed.push(ExecutedCommand { command, outcome });
            if got_root {
                break;
            }
        }

        self.write_round(turn, &completion, &executed)?;
        Ok(TurnReport {
            turn,
            completion,
            commands: executed,
            got_root,
        })
    }

    /// Turn a completion into the commands to dispatch.
    fn postprocess(&self, completion: &str) -> Result<Vec<String>> {
        if !self.settings.enable_cot {
            return Ok(vec![fix_command_output(completion)]);
        }
        let commands = extract_tagged_commands(completion);
        if commands.is_empty() {
            return Err(MissingCommandBlockError {
                completion: completion.to_string(),
            }
            .into());
        }
        Ok(commands)
    }

    fn facts_tokens(&self) -> usize {
        if self.settings.enable_update_state {
            self.reasoner.count_tokens(&self.state.facts)
        } else {
            0
        }
    }

    /// Tokens taken by the parts of the prompt that change every turn.
    fn dynamic_tokens(&self) -> usize {
        let vectors: usize = self
            .state
            .failed_vectors
            .iter()
            .map(|vector| self.reasoner.count_tokens(vector) + 1)
            .sum();
        let analysis = self
            .state
            .analysis
            .as_deref()
            .map_or(0, |text| self.reasoner.count_tokens(text));
        self.facts_tokens() + vectors + analysis
    }

    fn render_prompt(&self) -> Result<String> {
        let budget = self.history_budget.saturating_sub(self.dynamic_tokens());
        let history = self.history.render(&self.reasoner, budget);
        let identity = self.dispatcher.session().identity();
        let prompt = self.prompts.render_next_command(&NextCommandPrompt {
            username: &identity.username,
            password: &identity.password,
            system: &self.settings.system,
            target_user: &self.settings.target_user,
            capabilities: &self.capability_block,
            history: &history,
            update_state: self.settings.enable_update_state,
            facts: &self.state.facts,
            guidance: self.guidance.as_deref(),
            failed_vectors: &self.state.failed_vectors,
            analysis: self.state.analysis.as_deref(),
            cot: self.settings.enable_cot,
        })?;
        Ok(prompt)
    }

    /// Room left for a command result inside a follow-up prompt.
    fn result_budget(&self) -> usize {
        self.reasoner
            .context_size()
            .saturating_sub(self.settings.safety_margin)
            .saturating_sub(self.facts_tokens())
    }

    fn update_facts(&mut self, command: &str, output: &str) -> Result<()> {
        let trimmed = trim_front(&self.reasoner, self.result_budget(), output);
        let prompt = self
            .prompts
            .render_update_state(command, &trimmed, &self.state.facts)?;
        let completion = self
            .reasoner
            .complete(&prompt)
            .context("ask reasoner to update facts")?;
        self.state.facts = completion.text.trim().to_string();
        self.state.bump();
        Ok(())
    }

    fn analyze(&mut self, command: &str, output: &str) -> Result<()> {
        let trimmed = trim_front(&self.reasoner, self.result_budget(), output);
        let prompt = self
            .prompts
            .render_analyze(command, &trimmed, &self.state.facts)?;
        let completion = self
            .reasoner
            .complete(&prompt)
            .context("ask reasoner to analyse result")?;
        self.state.analysis = Some(completion.text.trim().to_string());
        self.state.bump();
        Ok(())
    }

    fn write_round(
        &self,
        turn: u32,
        completion: &Completion,
        executed: &[ExecutedCommand],
    ) -> Result<()> {
        let Some(log) = &self.run_log else {
            return Ok(());
        };
        let commands = executed
            .iter()
            .map(|c| match &c.outcome {
                DispatchOutcome::Rejected { reason } => CommandLog {
                    capability: None,
                    arguments: c.command.clone(),
                    output: reason.clone(),
                    got_root: false,
                    duration_ms: 0,
                },
                DispatchOutcome::Executed {
                    capability,
                    arguments,
                    output,
                    got_root,
                    duration,
                } => CommandLog {
                    capability: Some((*capability).to_string()),
                    arguments: arguments.clone(),
                    output: output.clone(),
                    got_root: *got_root,
                    duration_ms: duration.as_millis() as u64,
                },
            })
            .collect();
        log.write_round(&RoundLog {
            turn,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            completion: completion.text.clone(),
            commands,
        })?;
        Ok(())
    }

    fn write_summary(
        &self,
        termination: Termination,
        turns: u32,
        failure: Option<String>,
    ) -> Result<()> {
        let Some(log) = &self.run_log else {
            return Ok(());
        };
        log.write_summary(&RunSummary {
            run_id: log.run_id().to_string(),
            success: termination == Termination::Succeeded,
            termination,
            reason: termination.as_str().to_string(),
            turns,
            failure,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{RunCommand, TestCredential};
    use crate::core::budget::TokenCounter;
    use crate::core::root_detect::ShellRootDetector;
    use crate::test_support::{ScriptedReasoner, ScriptedShell, ShellReply, scripted_session};

    fn settings(max_turns: u32) -> AgentSettings {
        AgentSettings {
            max_turns,
            history: HistoryMode::Full,
            enable_cot: false,
            enable_update_state: false,
            enable_explanation: false,
            enable_structured_guidance: false,
            hint: None,
            system: "linux".to_string(),
            target_user: "root".to_string(),
            safety_margin: 128,
            strategy_overhead_tokens: 0,
            log_dir: None,
        }
    }

    fn dispatcher(shell: ScriptedShell) -> CapabilityDispatcher<ScriptedShell> {
        let mut dispatcher = CapabilityDispatcher::new(
            scripted_session(shell),
            Box::new(ShellRootDetector::new()),
            "root",
        );
        dispatcher.register(RunCommand::new(), true).expect("register");
        dispatcher
            .register(TestCredential::new(), false)
            .expect("register");
        dispatcher
    }

    fn lowpriv_shell() -> ScriptedShell {
        ScriptedShell::new(|cmd| match cmd {
            "cat /etc/shadow" => ShellReply::output("cat: /etc/shadow: Permission denied", 1),
            "sudo -u#-1 id" => ShellReply::ok("uid=0(root) gid=1000(lowpriv)"),
            _ => ShellReply::ok("uid=1000(lowpriv) gid=1000(lowpriv)"),
        })
    }

    #[test]
    fn exhausts_after_exactly_max_turns() {
        let reasoner = ScriptedReasoner::repeating("id");
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(3)).expect("agent");

        let mut turns = Vec::new();
        let outcome = agent.run(|report| turns.push(report.turn)).expect("run");

        assert_eq!(outcome.stop, RunStop::Exhausted { max_turns: 3 });
        assert_eq!(outcome.termination(), Termination::Exhausted);
        assert_eq!(turns, vec![1, 2, 3]);
        assert_eq!(agent.reasoner().prompts().len(), 3);
        assert_eq!(agent.phase(), AgentPhase::Exhausted);
        assert_eq!(agent.rounds().len(), 3);
        assert!(!agent.state().success);
    }

    #[test]
    fn stops_on_first_root_command() {
        let reasoner = ScriptedReasoner::new(["id", "`sudo -u#-1 id`", "whoami"]);
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(10)).expect("agent");

        let outcome = agent.run(|_| {}).expect("run");
        assert_eq!(
            outcome.stop,
            RunStop::GotRoot {
                turn: 2,
                command: "sudo -u#-1 id".to_string()
            }
        );
        assert!(outcome.success());
        assert_eq!(agent.phase(), AgentPhase::Succeeded);
        assert_eq!(agent.reasoner().prompts().len(), 2);
        assert!(agent.state().success);
        assert!(agent.dispatcher().session().channel().transport().closes() >= 1);
    }

    #[test]
    fn history_reaches_next_prompt() {
        let reasoner = ScriptedReasoner::new(["id", "whoami"]);
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(2)).expect("agent");
        agent.run(|_| {}).expect("run");

        let prompts = agent.reasoner().prompts();
        assert!(!prompts[0].contains("$ id"));
        assert!(prompts[1].contains("$ id\nuid=1000(lowpriv) gid=1000(lowpriv)"));
    }

    #[test]
    fn repeated_failures_become_negative_guidance() {
        let reasoner = ScriptedReasoner::repeating("cat /etc/shadow");
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(3)).expect("agent");
        agent.run(|_| {}).expect("run");

        let prompts = agent.reasoner().prompts();
        assert!(!prompts[1].contains("read_shadow"));
        assert!(prompts[2].contains("- read_shadow: failed 2x (last: 'cat /etc/shadow')"));
        assert_eq!(agent.state().failed_vectors.len(), 1);
    }

    #[test]
    fn parse_failure_is_a_failed_round_not_an_error() {
        let reasoner = ScriptedReasoner::new(["test_credential root", "id"]);
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(2)).expect("agent");
        let outcome = agent.run(|_| {}).expect("run");
        assert_eq!(outcome.termination(), Termination::Exhausted);
        assert!(agent.rounds()[0].result.contains("expects exactly two arguments"));
        assert!(agent.reasoner().prompts()[1].contains("$ test_credential root"));
    }

    #[test]
    fn cot_dispatches_every_block_and_requires_one() {
        let reasoner = ScriptedReasoner::new([
            "Let me look around.\n<command>id</command>\n<command>exec_command whoami</command>",
            "I have no idea.",
        ]);
        let mut cfg = settings(5);
        cfg.enable_cot = true;
        let mut agent = Agent::new(dispatcher(lowpriv_shell()), reasoner, cfg).expect("agent");

        let err = agent.run(|_| {}).unwrap_err();
        assert!(err.downcast_ref::<MissingCommandBlockError>().is_some());
        assert_eq!(agent.phase(), AgentPhase::Failed);
        assert_eq!(agent.rounds().len(), 2);
        assert_eq!(agent.rounds()[1].command, "exec_command whoami");
    }

    #[test]
    fn facts_and_analysis_feed_the_next_prompt() {
        let reasoner = ScriptedReasoner::new([
            "id",
            "- user is lowpriv",
            "nothing to escalate yet",
            "whoami",
            "- user is lowpriv\n- whoami works",
            "still nothing",
        ]);
        let mut cfg = settings(2);
        cfg.enable_update_state = true;
        cfg.enable_explanation = true;
        let mut agent = Agent::new(dispatcher(lowpriv_shell()), reasoner, cfg).expect("agent");
        agent.run(|_| {}).expect("run");

        let prompts = agent.reasoner().prompts();
        assert_eq!(prompts.len(), 6);
        assert!(prompts[1].contains("'id'"));
        assert!(prompts[3].contains("- user is lowpriv"));
        assert!(prompts[3].contains("nothing to escalate yet"));
        assert_eq!(agent.state().facts, "- user is lowpriv\n- whoami works");
        assert_eq!(agent.state().analysis.as_deref(), Some("still nothing"));
    }

    #[test]
    fn history_is_trimmed_to_budget() {
        let commands: Vec<String> = (1..=30).map(|i| format!("ls /var/{i}")).collect();
        let reasoner = ScriptedReasoner::new(commands).with_context_size(1200);
        let shell = ScriptedShell::new(|_| ShellReply::ok(&"drwxr-xr-x 2 root root 4096 x\n".repeat(4)));
        let mut agent = Agent::new(dispatcher(shell), reasoner, settings(30)).expect("agent");
        let budget = agent.history_budget();
        assert!(budget > 0);
        agent.run(|_| {}).expect("run");

        let prompts = agent.reasoner().prompts();
        let last = prompts.last().expect("prompt");
        assert!(agent.reasoner().count_tokens(last) <= 1200 - 128);
        assert!(agent.reasoner().count_tokens(&agent.history().text()) > budget);
        assert!(last.contains("$ ls /var/29\n"));
        assert!(!last.contains("$ ls /var/1\n"));
    }

    #[test]
    fn run_log_records_rounds_and_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reasoner = ScriptedReasoner::new(["id", "sudo -u#-1 id"]);
        let mut cfg = settings(5);
        cfg.log_dir = Some(temp.path().to_path_buf());
        let mut agent = Agent::new(dispatcher(lowpriv_shell()), reasoner, cfg).expect("agent");
        let outcome = agent.run(|_| {}).expect("run");

        let log = agent.run_log().expect("run log");
        assert_eq!(outcome.run_id.as_deref(), Some(log.run_id()));
        assert!(log.round_path(1).is_file());
        assert!(log.round_path(2).is_file());
        assert!(!log.round_path(3).exists());
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(log.summary_path()).expect("read"),
        )
        .expect("json");
        assert_eq!(summary["success"], true);
        assert_eq!(summary["turns"], 2);
    }

    #[test]
    fn reasoner_error_fails_the_run() {
        let reasoner = ScriptedReasoner::new(["id"]);
        let mut agent =
            Agent::new(dispatcher(lowpriv_shell()), reasoner, settings(3)).expect("agent");
        let err = agent.run(|_| {}).unwrap_err();
        assert!(format!("{err:#}").contains("turn 2 failed"));
        assert_eq!(agent.phase(), AgentPhase::Failed);
        assert!(agent.run(|_| {}).is_err());
    }
}
