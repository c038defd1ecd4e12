//! Channel processor contract and registry
//!
//! A channel processor performs the real-world side effect of an approved
//! work item (sending mail, posting, invoicing). The orchestrator only sees
//! per-item outcomes; how a processor fulfills an action is opaque to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vault_core::config::ProcessorConfig;
use vault_core::{Result, VaultConfig, VaultError, WorkItem};
use vault_resilience::{with_retry, RetryPolicy};

/// Exit code a command uses to report a temporary failure (sysexits EX_TEMPFAIL)
pub const EXIT_TEMPFAIL: i32 = 75;

/// Outcome status reported per item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    SkippedDuplicate,
    Skipped,
}

/// Result of processing one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub file: String,
    pub status: OutcomeStatus,
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Downstream identifier of the performed action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
    /// For duplicates: the file the content was first processed as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file: Option<String>,
    /// Name the item was archived under in `Done`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_as: Option<String>,
}

impl ProcessOutcome {
    fn new(file: &str, processor: &str, status: OutcomeStatus) -> Self {
        Self {
            file: file.to_string(),
            status,
            processor: processor.to_string(),
            message: None,
            result_reference: None,
            original_file: None,
            archived_as: None,
        }
    }

    pub fn success(file: &str, processor: &str, result_reference: Option<String>) -> Self {
        Self {
            result_reference,
            ..Self::new(file, processor, OutcomeStatus::Success)
        }
    }

    pub fn error(file: &str, processor: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(file, processor, OutcomeStatus::Error)
        }
    }

    pub fn skipped(file: &str, processor: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(file, processor, OutcomeStatus::Skipped)
        }
    }

    pub fn duplicate(file: &str, processor: &str, original_file: &str, archived_as: Option<String>) -> Self {
        Self {
            original_file: Some(original_file.to_string()),
            archived_as,
            ..Self::new(file, processor, OutcomeStatus::SkippedDuplicate)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Performs the side effect of approved work items
#[async_trait]
pub trait ChannelProcessor: Send + Sync {
    /// Processor name, reported in outcomes and the signature registry
    fn name(&self) -> &str;

    /// Service tracked by the health monitor
    fn service(&self) -> &str {
        self.name()
    }

    /// Metadata keys every item must carry
    fn required_metadata(&self) -> &[String] {
        &[]
    }

    /// Only a local-role agent may run this processor
    fn local_only(&self) -> bool {
        true
    }

    /// Process a batch, returning one outcome per item.
    ///
    /// An `Err` means the service itself failed and no item was processed.
    async fn process(&self, items: &[WorkItem]) -> Result<Vec<ProcessOutcome>>;
}

/// Kind tag -> processor, resolved once at startup
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    by_kind: BTreeMap<String, Arc<dyn ChannelProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command processors from `[[processors]]` config entries
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let policy = RetryPolicy::from(&config.retry);
        let mut registry = Self::new();
        for entry in &config.processors {
            let processor = CommandProcessor::new(entry.clone(), policy.clone())?;
            registry.register(&entry.kinds, Arc::new(processor));
        }
        Ok(registry)
    }

    /// Route `kinds` to `processor`, replacing earlier registrations
    pub fn register<S: AsRef<str>>(&mut self, kinds: &[S], processor: Arc<dyn ChannelProcessor>) {
        for kind in kinds {
            let kind = kind.as_ref().to_lowercase();
            if let Some(previous) = self.by_kind.insert(kind.clone(), Arc::clone(&processor)) {
                warn!(
                    "Kind {} re-registered: {} replaces {}",
                    kind,
                    processor.name(),
                    previous.name()
                );
            }
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ChannelProcessor>> {
        self.by_kind.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.by_kind.keys().map(String::as_str)
    }

    /// Distinct processors, one per name
    pub fn processors(&self) -> Vec<Arc<dyn ChannelProcessor>> {
        let mut seen = BTreeMap::new();
        for processor in self.by_kind.values() {
            seen.entry(processor.name().to_string())
                .or_insert_with(|| Arc::clone(processor));
        }
        seen.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}

/// Channel processor backed by an external command.
///
/// The command is run once per item with the item path appended as the last
/// argument. Exit 0 is success and the last stdout line becomes the result
/// reference. Exit 75 or a timeout is a transient failure and is retried;
/// any other exit code fails that item only.
pub struct CommandProcessor {
    config: ProcessorConfig,
    policy: RetryPolicy,
}

impl CommandProcessor {
    pub fn new(config: ProcessorConfig, policy: RetryPolicy) -> Result<Self> {
        if config.command.is_empty() {
            return Err(VaultError::Config(format!(
                "Processor {} has an empty command",
                config.name
            )));
        }
        Ok(Self { config, policy })
    }

    async fn run_once(&self, item: &WorkItem) -> Result<Option<String>> {
        let program = &self.config.command[0];
        let mut command = Command::new(program);
        command
            .args(&self.config.command[1..])
            .arg(&item.path)
            .env("VAULT_ITEM_KIND", &item.kind)
            .env("VAULT_ITEM_NAME", &item.name)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(VaultError::Processor(format!(
                    "Failed to run {}: {}",
                    program, e
                )))
            }
            Err(_) => {
                return Err(VaultError::Timeout(format!(
                    "{} exceeded {}s on {}",
                    self.config.name, self.config.timeout_secs, item.name
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => {
                let reference = stdout
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(str::to_string);
                Ok(reference)
            }
            Some(EXIT_TEMPFAIL) => Err(VaultError::Transient(format!(
                "{} reported a temporary failure: {}",
                self.config.name,
                stderr.trim()
            ))),
            code => Err(VaultError::Permanent(format!(
                "{} exited with {}: {}",
                self.config.name,
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl ChannelProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn service(&self) -> &str {
        self.config.service.as_deref().unwrap_or(&self.config.name)
    }

    fn required_metadata(&self) -> &[String] {
        &self.config.required_metadata
    }

    fn local_only(&self) -> bool {
        self.config.local_only
    }

    async fn process(&self, items: &[WorkItem]) -> Result<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::with_capacity(items.len());
        let mut any_success = false;

        for (idx, item) in items.iter().enumerate() {
            let op_name = format!("{}:{}", self.config.name, item.name);
            match with_retry(&op_name, &self.policy, || self.run_once(item)).await {
                Ok(reference) => {
                    info!(processor = %self.config.name, "Processed {}", item.name);
                    any_success = true;
                    outcomes.push(ProcessOutcome::success(&item.name, self.name(), reference));
                }
                Err(e) if self.policy.is_retryable(&e) => {
                    // The service is down; stop instead of burning through the batch
                    if !any_success {
                        return Err(e);
                    }
                    let message = format!("Service failure, not attempted: {}", e);
                    for rest in &items[idx..] {
                        outcomes.push(ProcessOutcome::error(&rest.name, self.name(), message.clone()));
                    }
                    break;
                }
                Err(e) => {
                    debug!(processor = %self.config.name, "{} failed: {}", item.name, e);
                    outcomes.push(ProcessOutcome::error(&item.name, self.name(), e.to_string()));
                }
            }
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn processor(script: &str) -> CommandProcessor {
        CommandProcessor::new(
            ProcessorConfig {
                name: "mailer".into(),
                kinds: vec!["email-send".into()],
                service: Some("gmail".into()),
                command: vec!["sh".into(), "-c".into(), script.into()],
                required_metadata: vec!["to".into()],
                local_only: true,
                timeout_secs: 5,
            },
            RetryPolicy::new(2, Duration::from_millis(10)),
        )
        .unwrap()
    }

    fn item(dir: &TempDir, name: &str) -> WorkItem {
        let path = dir.path().join(name);
        std::fs::write(&path, "---\nto: a@example.com\n---\nhi\n").unwrap();
        WorkItem::parse(&path, "---\nto: a@example.com\n---\nhi\n")
    }

    #[tokio::test]
    async fn test_success_reports_last_stdout_line() {
        let dir = TempDir::new().unwrap();
        let processor = processor("echo sending; echo msg-42");
        let outcomes = processor
            .process(&[item(&dir, "EMAIL_SEND_1.md")])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].result_reference.as_deref(), Some("msg-42"));
        assert_eq!(processor.service(), "gmail");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_per_item() {
        let dir = TempDir::new().unwrap();
        let processor = processor("echo bad address >&2; exit 2");
        let outcomes = processor
            .process(&[item(&dir, "EMAIL_SEND_1.md"), item(&dir, "EMAIL_SEND_2.md")])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Error));
        assert!(outcomes[0].message.as_deref().unwrap().contains("bad address"));
    }

    #[tokio::test]
    async fn test_tempfail_fails_whole_batch() {
        let dir = TempDir::new().unwrap();
        let processor = processor("exit 75");
        let err = processor
            .process(&[item(&dir, "EMAIL_SEND_1.md")])
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Transient(_)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = CommandProcessor::new(
            ProcessorConfig {
                name: "broken".into(),
                kinds: vec![],
                service: None,
                command: vec![],
                required_metadata: vec![],
                local_only: true,
                timeout_secs: 1,
            },
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[test]
    fn test_registry_from_config() {
        let config: VaultConfig = toml_config(
            r#"
[[processors]]
name = "mailer"
kinds = ["email-send", "EMAIL-REPLY"]
command = ["send-mail"]
"#,
        );
        let registry = ProcessorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.get("email-send").unwrap().name(), "mailer");
        assert_eq!(registry.get("email-reply").unwrap().name(), "mailer");
        assert!(registry.get("odoo-invoice").is_none());
        assert_eq!(registry.processors().len(), 1);
    }

    fn toml_config(text: &str) -> VaultConfig {
        let dir = TempDir::new().unwrap();
        let path = VaultConfig::path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        VaultConfig::load_or_default(dir.path()).unwrap()
    }
}
