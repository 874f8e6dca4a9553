use super::{TransferError, TransferTrigger};
use crate::config::TransferSettings;
use crate::protocol::posix_path;
use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;
use tokio::process::Command;

/// One external command of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TransferCommand {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }
}

/// `scp -r` the run directory, then open up group permissions over `ssh`
pub struct ScpTransfer {
    settings: TransferSettings,
    scp_program: String,
    ssh_program: String,
}

impl ScpTransfer {
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            settings,
            scp_program: "scp".to_string(),
            ssh_program: "ssh".to_string(),
        }
    }

    /// Substitute the executables, e.g. a wrapper script
    pub fn with_programs(mut self, scp: impl Into<String>, ssh: impl Into<String>) -> Self {
        self.scp_program = scp.into();
        self.ssh_program = ssh.into();
        self
    }

    /// Commands run for `result_dir`, in order
    pub fn plan(&self, result_dir: &Path) -> Result<Vec<TransferCommand>, TransferError> {
        let run_dir_name = result_dir
            .file_name()
            .ok_or_else(|| TransferError::InvalidDirectory(result_dir.to_path_buf()))?;

        let source = match &self.settings.source_prefix {
            Some(prefix) => format!("{}:{}", prefix, posix_path(result_dir)),
            None => posix_path(result_dir),
        };
        let host = &self.settings.destination_host;
        let dest_dir = posix_path(&self.settings.destination_dir);
        let copied = posix_path(&self.settings.destination_dir.join(run_dir_name));

        let mut plan = vec![TransferCommand::new(
            &self.scp_program,
            vec!["-r".to_string(), source, format!("{}:{}", host, dest_dir)],
        )];

        if self.settings.grant_group_read {
            for _ in 0..self.settings.chmod_passes {
                plan.push(TransferCommand::new(
                    &self.ssh_program,
                    vec![host.clone(), format!("chmod g+x {}", copied)],
                ));
                plan.push(TransferCommand::new(
                    &self.ssh_program,
                    vec![host.clone(), format!("chmod -R g+r {}", copied)],
                ));
            }
        }

        Ok(plan)
    }
}

async fn execute(command: &TransferCommand) -> Result<(), TransferError> {
    debug!("Running {} {}", command.program, command.args.join(" "));
    let output = Command::new(&command.program)
        .args(&command.args)
        .output()
        .await
        .map_err(|source| TransferError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }

    Err(TransferError::CommandFailed {
        program: command.program.clone(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl TransferTrigger for ScpTransfer {
    fn destination(&self) -> String {
        format!(
            "{}:{}",
            self.settings.destination_host,
            posix_path(&self.settings.destination_dir)
        )
    }

    async fn on_run_complete(&self, result_dir: &Path) -> Result<(), TransferError> {
        let plan = self.plan(result_dir)?;
        for command in &plan {
            execute(command).await?;
        }
        info!("scp of {} complete", result_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings() -> TransferSettings {
        TransferSettings {
            enabled: true,
            source_prefix: Some("varex@172.21.43.22".to_string()),
            destination_host: "archive".to_string(),
            destination_dir: PathBuf::from("/data/panel"),
            grant_group_read: true,
            chmod_passes: 2,
        }
    }

    #[test]
    fn test_plan_copies_then_chmods_each_pass() {
        let plan = ScpTransfer::new(settings())
            .plan(Path::new("/home/varex/Runs/exp1/42"))
            .unwrap();

        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].program, "scp");
        assert_eq!(
            plan[0].args,
            vec![
                "-r",
                "varex@172.21.43.22:/home/varex/Runs/exp1/42",
                "archive:/data/panel"
            ]
        );
        assert_eq!(plan[1].args, vec!["archive", "chmod g+x /data/panel/42"]);
        assert_eq!(plan[2].args, vec!["archive", "chmod -R g+r /data/panel/42"]);
        assert_eq!(plan[3], plan[1]);
        assert_eq!(plan[4], plan[2]);
    }

    #[test]
    fn test_plan_without_group_read() {
        let mut s = settings();
        s.grant_group_read = false;
        s.source_prefix = None;
        let plan = ScpTransfer::new(s).plan(Path::new("/Runs/exp1/42")).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].args[1], "/Runs/exp1/42");
    }

    #[test]
    fn test_plan_rejects_root() {
        let err = ScpTransfer::new(settings()).plan(Path::new("/")).unwrap_err();
        assert!(matches!(err, TransferError::InvalidDirectory(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_commands() {
        let transfer = ScpTransfer::new(settings()).with_programs("true", "true");
        transfer
            .on_run_complete(Path::new("/Runs/exp1/42"))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_copy_is_reported() {
        let transfer = ScpTransfer::new(settings()).with_programs("false", "true");
        let err = transfer
            .on_run_complete(Path::new("/Runs/exp1/42"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::CommandFailed { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let transfer = ScpTransfer::new(settings())
            .with_programs("panel-daq-no-such-scp", "panel-daq-no-such-ssh");
        let err = transfer
            .on_run_complete(Path::new("/Runs/exp1/42"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Spawn { .. }));
    }
}
