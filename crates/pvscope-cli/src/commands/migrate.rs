//! `pvscope migrate`: grow a claim by moving it onto a new volume.
//!
//! Runs the full migration in the foreground. Progress is checkpointed, so
//! running the same command again after a crash, an interrupt, or an abort
//! continues where the previous run stopped.
//!
//! # Usage
//!
//! ```bash
//! pvscope migrate --namespace db --pvc data-db-0 --size 50Gi --workload db
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pvscope_common::kube_utils::create_client;
use pvscope_migrate::{
    FileCheckpointStore, KubeClusterClient, KubeEventPublisher, MigrationRequest, Migrator,
    SagaError,
};

use super::ClaimArgs;
use crate::config::FileConfig;
use crate::Result;

/// Resize a claim by migrating it onto a new volume
#[derive(Args, Debug)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub claim: ClaimArgs,

    /// Target size, e.g. 50Gi
    #[arg(long)]
    pub size: String,

    /// StatefulSet that mounts the claim
    #[arg(long)]
    pub workload: String,

    /// Storage class for the new volume (defaults to the claim's class)
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Path to kubeconfig (defaults to the config file, then kube defaults)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl MigrateArgs {
    /// Migration request described by the flags
    pub fn request(&self) -> MigrationRequest {
        let request = MigrationRequest::new(
            &self.claim.namespace,
            &self.claim.pvc,
            &self.size,
            &self.workload,
        );
        match &self.storage_class {
            Some(class) => request.with_storage_class(class),
            None => request,
        }
    }

    /// Kubeconfig to use: the flag wins over the config file
    pub fn kubeconfig(&self, file: &FileConfig) -> Option<PathBuf> {
        self.kubeconfig
            .clone()
            .or_else(|| file.kubeconfig.as_ref().map(PathBuf::from))
    }
}

/// Run the migrate command.
pub async fn run(args: MigrateArgs, file: &FileConfig, checkpoint_dir: PathBuf) -> Result<()> {
    let request = args.request();
    let config = file.to_migrate_config()?;
    let client = create_client(args.kubeconfig(file).as_deref()).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current wait");
            interrupt.cancel();
        }
    });

    let migrator = Migrator::builder(Arc::new(KubeClusterClient::new(client.clone())))
        .checkpoints(Arc::new(FileCheckpointStore::new(checkpoint_dir)))
        .events(Arc::new(KubeEventPublisher::new(client)))
        .config(config)
        .cancel_token(cancel)
        .build();

    match migrator.run(request).await {
        Ok(state) => {
            info!(
                namespace = %state.request.namespace,
                claim = %state.request.claim_name,
                size = %state.request.target_size,
                "migration finished"
            );
            eprintln!(
                "Migrated {}/{} to {}.",
                state.request.namespace, state.request.claim_name, state.request.target_size
            );
            Ok(())
        }
        Err(err) => {
            report_abort(&err)?;
            Err(err.into())
        }
    }
}

/// Print where an aborted migration stopped and the state it captured.
///
/// The state goes to stdout so it can be piped into a file; everything else
/// goes to stderr.
fn report_abort(err: &SagaError) -> Result<()> {
    if let (Some(step), Some(state)) = (err.step(), err.state()) {
        eprintln!("Migration aborted at step {}.", step);
        eprintln!("Fix the cause and re-run the same command to resume, or `pvscope forget` to discard.");
        eprintln!("Captured state:");
        println!("{}", serde_json::to_string_pretty(state)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> MigrateArgs {
        MigrateArgs {
            claim: ClaimArgs {
                namespace: "db".to_string(),
                pvc: "data".to_string(),
            },
            size: "5Gi".to_string(),
            workload: "db".to_string(),
            storage_class: None,
            kubeconfig: None,
        }
    }

    #[test]
    fn request_from_flags() {
        let request = args().request();
        assert_eq!(request, MigrationRequest::new("db", "data", "5Gi", "db"));

        let mut with_class = args();
        with_class.storage_class = Some("fast".to_string());
        assert_eq!(with_class.request().storage_class.as_deref(), Some("fast"));
    }

    #[test]
    fn kubeconfig_flag_overrides_file() {
        let file = FileConfig {
            kubeconfig: Some("/etc/pvscope/kubeconfig".to_string()),
            ..Default::default()
        };
        assert_eq!(
            args().kubeconfig(&file),
            Some(PathBuf::from("/etc/pvscope/kubeconfig"))
        );

        let mut flagged = args();
        flagged.kubeconfig = Some(PathBuf::from("/tmp/kc"));
        assert_eq!(flagged.kubeconfig(&file), Some(PathBuf::from("/tmp/kc")));

        assert_eq!(args().kubeconfig(&FileConfig::default()), None);
    }
}
