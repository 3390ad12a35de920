//! Wires a mount session together: scratch directory, control socket,
//! engine, and the FUSE main loop.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fuser::MountOption;

use crate::api::Api;
use crate::fs::{Engine, EngineOptions};
use crate::fuse::CgFuse;
use crate::socket::ControlListener;

/// Builds the engine and blocks serving the filesystem until it is
/// unmounted. Everything created here (scratch files, the control
/// socket) is gone when this returns.
pub fn create_and_mount(
    api: Api,
    mountpoint: &Path,
    options: EngineOptions,
) -> anyhow::Result<()> {
    if !options.fixed {
        log::warn!("=====================================================");
        log::warn!("Mounting in non-fixed mode, all changes will be");
        log::warn!("visible and additions to students.");
        log::warn!("Watch out when uploading grading scripts!");
        log::warn!("=====================================================");
    }

    let scratch = tempfile::tempdir().context("failed to create the scratch directory")?;
    let listener =
        ControlListener::bind(scratch.path()).context("failed to bind the control socket")?;

    let engine = Engine::new(
        api,
        options,
        mountpoint,
        scratch.path(),
        listener.address(),
    )
    .context("failed to build the filesystem tree")?;
    let engine = Arc::new(Mutex::new(engine));

    let server = listener.serve(Arc::clone(&engine));

    let mount_options = [
        MountOption::FSName("cgfs".to_owned()),
        MountOption::AutoUnmount,
    ];
    fuser::mount2(CgFuse::new(engine), mountpoint, &mount_options)
        .context("failed to mount the filesystem")?;

    // The accept loop notices the flag within one tick; dropping the
    // server handle joins the thread.
    server.shutdown();
    drop(server);
    Ok(())
}
