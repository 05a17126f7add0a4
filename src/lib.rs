//! Edge device VM testbed
//!
//! Brings a virtual edge device up for testing and tears it down again:
//! certificates are issued, the device configuration is synced to a file or
//! a management controller, and the VM is started on VirtualBox, QEMU or
//! Parallels with its port forwards reconciled.

pub mod certs;
pub mod config;
pub mod hypervisor;
pub mod lifecycle;
pub mod models;
pub mod sync;
pub mod utils;
