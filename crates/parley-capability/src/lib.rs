// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-agent capability catalogue: MCP servers (with tool schemas), skill
//! packs, and built-in tools.
//!
//! The registry is rebuilt on every actor activation and never shared across
//! actors.  Its description text is a system-prompt fragment and is cached
//! until the next registration.

mod registry;

pub use registry::{
    BuiltinTool, CapabilityRegistry, McpCapability, McpToolInfo, SkillCapability, ToolCapability,
};
