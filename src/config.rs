/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator.

use std::time::Duration;

/// Runtime parameters of the engine. Both values originate in the system-contract
/// configuration channel of the surrounding node: `view_timeout` is conventionally three
/// times the configured block interval, and the node pushes updates through
/// [`set_omit_empty_block`](crate::engine::PbftEngine::set_omit_empty_block) and
/// [`reset_config`](crate::engine::PbftEngine::reset_config) when the channel reports a
/// change.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Base view timeout. The effective deadline backs off as `view_timeout * 1.5^k`
    /// with `k` the number of consecutive timeouts at the current height.
    pub view_timeout: Duration,

    /// Whether a leader proposal carrying zero transactions should be skipped via an
    /// immediate view change instead of being sealed.
    pub omit_empty_block: bool,
}
