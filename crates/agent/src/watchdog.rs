//! Supervises one running helper generation: restarts it if it dies
//! unexpectedly while the embedding web server is still alive, and tears
//! the whole process group down on a crash or a graceful shutdown
//! request.

use std::sync::Arc;

use apppool_core::{Account, AccountsDatabase, Rights, ServerInstanceDir};
use tracing::{error, info, warn};

use crate::cli::Args;
use crate::feedback::{self, Monitor};
use crate::helper::{self, Helper};
use crate::password;

/// Process exit codes, per the supervision contract: 0 normal exit, 1
/// startup failure, 2 killed after the embedding web server disappeared.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILED: i32 = 1;
pub const EXIT_KILLED: i32 = 2;

pub async fn run(args: Args) -> i32 {
    let temp_dir = args.resolved_temp_dir();
    let instance_dir = match ServerInstanceDir::create(&temp_dir, std::process::id()) {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "failed to create server instance directory");
            return EXIT_STARTUP_FAILED;
        }
    };
    info!(path = %instance_dir.path().display(), "server instance directory ready");

    let accounts = Arc::new(AccountsDatabase::new());
    accounts.add(Account::with_plain_password(
        "_watchdog",
        password::generate(),
        Rights::ALL,
    ));
    info!("generated per-boot RPC account");

    let feedback = match Monitor::new(args.feedback_fd) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!(error = %e, "failed to watch feedback fd");
            return EXIT_STARTUP_FAILED;
        }
    };

    let mut current = match helper::start(&args, accounts.clone(), &instance_dir).await {
        Ok(helper) => helper,
        Err(e) => {
            error!(error = %e, "failed to start helper");
            return EXIT_STARTUP_FAILED;
        }
    };

    loop {
        tokio::select! {
            result = &mut current.server_task => {
                match result {
                    Ok(()) => info!("helper accept loop exited"),
                    Err(e) => warn!(error = %e, "helper task ended abnormally"),
                }
                match restart(&args, &accounts, &instance_dir, current).await {
                    Some(helper) => { current = helper; }
                    None => return EXIT_STARTUP_FAILED,
                }
            }
            event = feedback.wait() => {
                match event {
                    feedback::Event::GracefulShutdown => {
                        info!("received graceful shutdown notice; stopping helper");
                        shutdown(current).await;
                        return EXIT_OK;
                    }
                    feedback::Event::WebServerGone => {
                        error!("embedding web server disappeared; killing process group");
                        current.server_task.abort();
                        let _ = nix::sys::signal::killpg(
                            nix::unistd::getpgrp(),
                            nix::sys::signal::Signal::SIGKILL,
                        );
                        return EXIT_KILLED;
                    }
                }
            }
        }
    }
}

async fn restart(
    args: &Args,
    accounts: &Arc<AccountsDatabase>,
    instance_dir: &ServerInstanceDir,
    dead: Helper,
) -> Option<Helper> {
    cleanup(dead).await;
    warn!("restarting helper after unexpected exit");
    match helper::start(args, accounts.clone(), instance_dir).await {
        Ok(helper) => Some(helper),
        Err(e) => {
            error!(error = %e, "failed to restart helper");
            None
        }
    }
}

async fn shutdown(helper: Helper) {
    helper.pool.shutdown().await;
    helper.server_task.abort();
    cleanup(helper).await;
}

async fn cleanup(helper: Helper) {
    let path = helper.generation_dir.path().to_path_buf();
    let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path)).await;
}
