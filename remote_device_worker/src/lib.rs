// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The remote device worker: hosts emulated PCI devices in a separate
//! process on behalf of a hypervisor-side proxy.
//!
//! The proxy forwards guest PCI accesses as frames over the link; the
//! worker's dispatcher routes them to a table of devices created on demand
//! from JSON option blobs, and answers either with a reply frame or
//! through the wait fd attached to the request.

#![forbid(unsafe_code)]

mod options;
mod registry;
mod worker;

pub use worker::RemoteDeviceWorker;
