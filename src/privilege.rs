/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use nix::unistd::{geteuid, getuid, Uid};
use std::fmt::Debug;

/// Answers whether the process may write control files.
///
/// The answer is advisory: the outcome of the write itself is authoritative.
pub trait PrivilegeGate: Send + Sync + Debug {
    fn is_privileged(&self) -> bool;
}

/// Grants writes when either the real or the effective user is root.
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessPrivilege;

impl ProcessPrivilege {
    pub fn uid(&self) -> Uid {
        getuid()
    }

    pub fn euid(&self) -> Uid {
        geteuid()
    }
}

impl PrivilegeGate for ProcessPrivilege {
    fn is_privileged(&self) -> bool {
        self.euid().is_root() || self.uid().is_root()
    }
}

/// A gate with a fixed answer. Forcing `false` stages values for preview
/// without ever touching the hardware.
#[derive(Debug, Copy, Clone)]
pub struct FixedPrivilege(pub bool);

impl PrivilegeGate for FixedPrivilege {
    fn is_privileged(&self) -> bool {
        self.0
    }
}
