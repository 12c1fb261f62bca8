// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - launching app lifecycle commands and signalling them.

pub mod launch;
pub mod signals;

pub use launch::{LaunchOptions, build_child_env, launch, port_env_name, write_setup_sentinel};
pub use signals::{leads_group, pid_alive, send_signal};
