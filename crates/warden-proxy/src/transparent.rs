//! Transparent-proxy rule controller.
//!
//! Builds the rule batch for the configured policy and runs it through one
//! elevated shell session. Each rule's command and output is logged. A rule
//! that exits non-zero is recorded and the batch continues, since removing a
//! rule that is already gone is normal during cleanup. A shell that cannot be
//! started or stops answering aborts the batch; rules already applied stay
//! in place and the error says how many there were. [`TransparentProxyController::clear`]
//! is the manual way back.

use serde::Serialize;
use warden_core::{LogBuffer, RulePolicy, RuleSetBuilder, RuleSpec};

use crate::error::{PrivilegeError, TransparentProxyError};
use crate::shell::{CommandOutput, PrivilegedShell};

/// One executed rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleOutcome {
    /// The rule that ran.
    pub rule: RuleSpec,
    /// What the shell reported.
    pub output: CommandOutput,
}

/// Result of a completed rule batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleBatchReport {
    /// Whether the batch installed (true) or removed (false) rules.
    pub activate: bool,
    /// Every rule in execution order.
    pub outcomes: Vec<RuleOutcome>,
}

impl RuleBatchReport {
    /// Number of rules executed.
    pub fn applied(&self) -> usize {
        self.outcomes.len()
    }

    /// Rules that exited non-zero.
    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.output.success())
    }

    /// Returns true if every rule exited with status 0.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Installs and removes the redirect rules.
#[derive(Debug, Clone)]
pub struct TransparentProxyController {
    builder: RuleSetBuilder,
    shell: PrivilegedShell,
    identity: String,
    log: Option<LogBuffer>,
}

impl TransparentProxyController {
    /// Creates a controller. `identity` is the uid whose traffic is never redirected.
    pub fn new(policy: RulePolicy, shell: PrivilegedShell, identity: impl Into<String>) -> Self {
        Self {
            builder: RuleSetBuilder::new(policy),
            shell,
            identity: identity.into(),
            log: None,
        }
    }

    /// Also writes every command and its output to `log`.
    pub fn with_log_buffer(mut self, log: LogBuffer) -> Self {
        self.log = Some(log);
        self
    }

    /// The configured excluded identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The rule policy in use.
    pub fn policy(&self) -> &RulePolicy {
        self.builder.policy()
    }

    /// Installs the rules, exempting `excluded_identity`.
    pub fn enable(&self, excluded_identity: &str) -> Result<RuleBatchReport, TransparentProxyError> {
        self.apply(true, excluded_identity)
    }

    /// Removes the rules installed for `excluded_identity`.
    pub fn disable(&self, excluded_identity: &str) -> Result<RuleBatchReport, TransparentProxyError> {
        self.apply(false, excluded_identity)
    }

    /// Removes the rules for the configured identity.
    pub fn clear(&self) -> Result<RuleBatchReport, TransparentProxyError> {
        self.disable(&self.identity)
    }

    fn apply(
        &self,
        activate: bool,
        excluded_identity: &str,
    ) -> Result<RuleBatchReport, TransparentProxyError> {
        let rules = self.builder.build(activate, excluded_identity);
        let total = rules.len();

        tracing::info!(
            "{} transparent proxy rules ({} rules via {})",
            if activate { "Installing" } else { "Removing" },
            total,
            self.shell.command_line()
        );

        let abort = |applied: usize, source: PrivilegeError| {
            tracing::error!("Rule batch aborted after {}/{}: {}", applied, total, source);
            TransparentProxyError {
                applied,
                total,
                source,
            }
        };

        if !is_plain_identity(excluded_identity) {
            return Err(abort(
                0,
                PrivilegeError::InvalidIdentity(excluded_identity.to_string()),
            ));
        }

        let mut session = self.shell.open().map_err(|e| abort(0, e))?;
        let mut report = RuleBatchReport {
            activate,
            outcomes: Vec::with_capacity(total),
        };

        for rule in rules {
            let output = match session.execute(&rule.command) {
                Ok(output) => output,
                Err(e) => return Err(abort(report.applied(), e)),
            };

            self.log_outcome(&rule, &output);
            report.outcomes.push(RuleOutcome { rule, output });
        }

        session.close();

        let failed = report.failures().count();
        if failed > 0 {
            tracing::warn!("{} of {} rules exited non-zero", failed, total);
        } else {
            tracing::info!("Applied {} rules", total);
        }

        Ok(report)
    }

    fn log_outcome(&self, rule: &RuleSpec, output: &CommandOutput) {
        tracing::debug!("{} -> {}", rule.command, output.exit_code);
        if !output.success() {
            tracing::warn!(
                "Rule exited {}: {} {}",
                output.exit_code,
                rule.command,
                output.stderr.trim_end()
            );
        }

        if let Some(log) = &self.log {
            log.append(&format!(
                "{}\n{}{}",
                rule.command, output.stdout, output.stderr
            ));
        }
    }
}

/// A uid or user name that is safe to splice into a shell command line.
fn is_plain_identity(identity: &str) -> bool {
    !identity.is_empty()
        && !identity.starts_with('-')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Uid of the running process, used as the default excluded identity.
#[cfg(unix)]
pub fn process_identity() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata("/proc/self").ok().map(|m| m.uid())
}

/// Uid of the running process, used as the default excluded identity.
#[cfg(not(unix))]
pub fn process_identity() -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::Direction;

    /// Policy whose binary just echoes its arguments.
    fn echo_policy() -> RulePolicy {
        RulePolicy {
            binary: "echo".to_string(),
            ..RulePolicy::default()
        }
    }

    fn sh() -> PrivilegedShell {
        PrivilegedShell::new("sh", Vec::<String>::new())
    }

    #[test]
    fn enable_runs_every_rule_in_order() {
        let controller = TransparentProxyController::new(echo_policy(), sh(), "10042");
        let report = controller.enable("10042").unwrap();

        let expected = RuleSetBuilder::new(echo_policy()).build(true, "10042");
        assert!(report.activate);
        assert_eq!(report.applied(), expected.len());
        assert!(report.is_clean());

        for (outcome, rule) in report.outcomes.iter().zip(&expected) {
            assert_eq!(&outcome.rule, rule);
        }

        // echo prints the arguments, i.e. the command minus the binary
        let first = &report.outcomes[0];
        assert_eq!(first.rule.direction, Direction::CreateChain);
        assert_eq!(first.output.stdout, "--new spplugin\n");
    }

    #[test]
    fn disable_and_clear_use_removal_batch() {
        let controller = TransparentProxyController::new(echo_policy(), sh(), "10042");

        let disabled = controller.disable("10042").unwrap();
        let cleared = controller.clear().unwrap();

        assert!(!disabled.activate);
        assert_eq!(disabled.outcomes[0].rule.direction, Direction::DetachChain);
        assert_eq!(disabled.applied(), cleared.applied());
    }

    #[test]
    fn non_zero_exit_is_recorded_not_fatal() {
        let policy = RulePolicy {
            binary: "false".to_string(),
            ..RulePolicy::default()
        };
        let controller = TransparentProxyController::new(policy, sh(), "0");
        let report = controller.disable("0").unwrap();

        assert_eq!(report.failures().count(), report.applied());
        assert!(!report.is_clean());
    }

    #[test]
    fn quoted_identity_is_rejected_before_spawning() {
        let controller = TransparentProxyController::new(echo_policy(), sh(), "10042");

        let err = controller.enable("1000' ; echo '").unwrap_err();
        assert_eq!(err.applied, 0);
        assert_eq!(err.total, 12);
        assert!(matches!(err.source, PrivilegeError::InvalidIdentity(_)));

        assert!(controller.disable("").is_err());
        assert!(controller.enable("u0_a42").is_ok());
    }

    #[test]
    fn plain_identities() {
        assert!(is_plain_identity("10042"));
        assert!(is_plain_identity("shell"));
        assert!(!is_plain_identity("-1"));
        assert!(!is_plain_identity("a b"));
        assert!(!is_plain_identity("x\"y"));
    }

    #[test]
    fn spawn_failure_aborts_with_nothing_applied() {
        let shell = PrivilegedShell::new("/nonexistent/warden-su", ["-c", "sh"]);
        let controller = TransparentProxyController::new(echo_policy(), shell, "1000");

        let err = controller.enable("1000").unwrap_err();
        assert_eq!(err.applied, 0);
        assert_eq!(err.total, 12);
        assert!(matches!(err.source, PrivilegeError::Spawn { .. }));
    }

    #[test]
    fn dying_shell_reports_applied_count() {
        // Evaluates two commands (three lines each), then exits.
        let shell = PrivilegedShell::new(
            "sh",
            [
                "-c",
                "i=0; while read line; do i=$((i+1)); if [ $i -gt 6 ]; then exit 0; fi; eval \"$line\"; done",
            ],
        );
        let controller = TransparentProxyController::new(echo_policy(), shell, "1000");

        let err = controller.enable("1000").unwrap_err();
        assert_eq!(err.applied, 2);
        assert!(matches!(err.source, PrivilegeError::SessionClosed { .. }));
    }

    #[test]
    fn outcomes_are_written_to_log_buffer() {
        let log = LogBuffer::default();
        let controller =
            TransparentProxyController::new(echo_policy(), sh(), "1000").with_log_buffer(log.clone());

        controller.enable("1000").unwrap();

        let text = log.text();
        // newest first: the last attach rule leads
        assert!(text.starts_with("echo -t nat -A OUTPUT -j sppluginOutput\n"));
        assert!(text.contains("--uid-owner 1000"));
    }

    #[test]
    fn process_identity_is_available() {
        assert!(process_identity().is_some());
    }
}
