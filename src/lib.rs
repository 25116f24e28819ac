// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod runtime;

pub mod sexp;

#[macro_use]
extern crate log;

pub use crate::runtime::{
    clock,
    deferred::Deferred,
    fail::Fail,
    fd::{
        Direction,
        FdKind,
        ReadyToResult,
        SharedFd,
        SocketKind,
    },
    ivar::SharedIvar,
    monitor::{
        try_with,
        SharedMonitor,
    },
    sequence::How,
    shutdown::{
        at_shutdown,
        shutdown,
        ShutdownState,
    },
    yield_now,
    SharedRuntime,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, otherwise bails out of the calling test with a diagnostic.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            anyhow::bail!(
                "ensure_eq!({}, {}) failed: {:?} != {:?}",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Ensures that two expressions are not equal, otherwise bails out of the calling test with a diagnostic.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            anyhow::bail!(
                "ensure_neq!({}, {}) failed: both are {:?}",
                stringify!($left),
                stringify!($right),
                left
            );
        }
    }};
}
