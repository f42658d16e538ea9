// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bootstrap for the remote device worker process.
//!
//! The launcher hands the worker two connected stream sockets on the
//! command line: `remote_device_worker <control-fd> <mmio-fd>
//! [device-json…]`. Any further arguments are device option blobs,
//! applied once the proxy starts creating devices. Device model crates
//! linked into this binary populate the factory registry before the loop
//! starts.

// UNSAFETY: adopting the socket fds passed down from the launcher.
#![expect(unsafe_code)]

use anyhow::Context;
use remote_device_worker::RemoteDeviceWorker;
use remote_link::Link;
use remote_pci_core::FactoryRegistry;
use remote_pci_core::MachineState;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        anyhow::bail!("usage: remote_device_worker <control-fd> <mmio-fd> [device-json...]");
    }
    let control = take_fd(&args[0]).context("control channel")?;
    let mmio = take_fd(&args[1]).context("mmio channel")?;
    let deferred_opts = args[2..].to_vec();

    let link = Link::new(control, mmio).context("failed to construct link")?;
    let factories = FactoryRegistry::new();
    let worker = RemoteDeviceWorker::new(&link, factories, MachineState::new(), deferred_opts);

    tracing::info!("remote device worker up");
    worker.run(link).context("link terminated")
}

fn take_fd(arg: &str) -> anyhow::Result<OwnedFd> {
    let raw: RawFd = arg
        .parse()
        .ok()
        .filter(|fd| *fd >= 0)
        .with_context(|| format!("bad fd argument {arg:?}"))?;
    // Probe so a stale number fails here instead of at the first frame.
    nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFL)
        .with_context(|| format!("fd {raw} is not open"))?;
    // SAFETY: the launcher transferred ownership of this descriptor via
    // the command line; nothing else in this process uses it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
