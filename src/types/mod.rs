/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types common across the engine's components.

pub mod block;

pub mod crypto_primitives;

pub mod data_types;

pub mod roster;
