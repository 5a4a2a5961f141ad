//! Device pairing through the vendor `aria` command line tool
//!
//! The SDK keeps pairing state outside the process; the only supported way to
//! inspect or create it is `aria auth check` and `aria auth pair`. Their
//! output is free text, so the classification rules live in pure functions
//! ([`classify_check`], [`classify_pair`]) that are tested without the tool.

use crate::error::{RelayError, Result};
use std::ffi::OsString;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// How long to wait after a pairing request before checking again. The user
/// has to accept the request in the companion app.
pub const DEFAULT_PAIRING_WAIT: Duration = Duration::from_secs(15);

/// Result of `aria auth check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    /// A pairing exists; carries the tool's description of it
    Paired(String),
    NotPaired,
}

impl PairingStatus {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairingStatus::Paired(_))
    }
}

/// Classify the output of `aria auth check`
pub fn classify_check(success: bool, stdout: &str) -> PairingStatus {
    if !success {
        return PairingStatus::NotPaired;
    }

    let out = stdout.to_lowercase();
    if out.contains("no devices found")
        || out.contains("there are no devices connected")
        || out.contains("[error]")
    {
        return PairingStatus::NotPaired;
    }

    PairingStatus::Paired(stdout.trim().to_string())
}

/// Classify the output of `aria auth pair`
pub fn classify_pair(success: bool, stdout: &str, stderr: &str) -> Result<()> {
    if !success || stdout.to_lowercase().contains("error") {
        return Err(RelayError::Pairing(format!(
            "Pairing failed: {}\n{}",
            stdout.trim(),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Wrapper around the vendor CLI
#[derive(Debug, Clone)]
pub struct AriaCli {
    program: OsString,
}

impl Default for AriaCli {
    fn default() -> Self {
        Self::new("aria")
    }
}

impl AriaCli {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RelayError::Pairing(format!(
                    "Failed to run {:?} {}: {}",
                    self.program,
                    args.join(" "),
                    e
                ))
            })
    }

    /// Check whether the host is paired with a device
    pub async fn check(&self) -> Result<PairingStatus> {
        let output = self.run(&["auth", "check"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let status = classify_check(output.status.success(), &stdout);

        match &status {
            PairingStatus::Paired(description) => {
                tracing::info!("Device paired to {}", description)
            }
            PairingStatus::NotPaired => {
                tracing::debug!("aria auth check: {}", stdout.trim())
            }
        }
        Ok(status)
    }

    /// Send a pairing request. The user must accept it in the companion app.
    pub async fn pair(&self) -> Result<()> {
        let output = self.run(&["auth", "pair"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!("aria auth pair stdout: {}", stdout.trim());
        tracing::debug!("aria auth pair stderr: {}", stderr.trim());

        classify_pair(output.status.success(), &stdout, &stderr)?;
        tracing::info!("Sent pairing request, check the companion app and accept it");
        Ok(())
    }

    /// Pair if needed, wait for the user to accept, then confirm
    pub async fn ensure_paired(&self, wait: Duration) -> Result<PairingStatus> {
        let status = self.check().await?;
        if status.is_paired() {
            return Ok(status);
        }

        tracing::info!("No pairing found, requesting one");
        self.pair().await?;
        tokio::time::sleep(wait).await;

        let status = self.check().await?;
        if !status.is_paired() {
            return Err(RelayError::Pairing(
                "Device is still not paired after the pairing request".to_string(),
            ));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_detects_missing_device() {
        assert_eq!(
            classify_check(true, "No devices found\n"),
            PairingStatus::NotPaired
        );
        assert_eq!(
            classify_check(true, "There are no devices connected"),
            PairingStatus::NotPaired
        );
        assert_eq!(
            classify_check(true, "[ERROR] certificate expired"),
            PairingStatus::NotPaired
        );
    }

    #[test]
    fn test_check_failure_status_means_not_paired() {
        assert_eq!(classify_check(false, "paired"), PairingStatus::NotPaired);
    }

    #[test]
    fn test_check_paired() {
        let status = classify_check(true, "  Aria 1WM103600M1292  \n");
        assert_eq!(status, PairingStatus::Paired("Aria 1WM103600M1292".to_string()));
        assert!(status.is_paired());
    }

    #[test]
    fn test_pair_rejects_error_output() {
        assert!(classify_pair(true, "Error: timed out", "").is_err());
        assert!(classify_pair(false, "", "denied").is_err());
        assert!(classify_pair(true, "Pairing request sent", "").is_ok());
    }

    #[tokio::test]
    async fn test_missing_tool_is_a_pairing_error() {
        let cli = AriaCli::new("aria-relay-test-no-such-binary");
        let err = cli.check().await.unwrap_err();
        assert!(matches!(err, RelayError::Pairing(_)));
    }
}
