// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `shelltest` command-line front end over [`shelltest_runner`].

mod dispatch;

pub use dispatch::ShelltestApp;
