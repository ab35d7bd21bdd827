/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits shared by every part of the consensus core.
//!
//! The definitions in [`data_types`] are "inert" types: they are sent around and inspected, but have
//! no active behavior. These types follow the newtype pattern, and the API for using them is defined
//! there.
//!
//! [`crypto_primitives`] wraps the key and signature types of this crate's cryptography dependency,
//! [`authority`] defines the federated and audit server sets that drive leader selection, and
//! [`blocks`] defines the typed block objects that the consensus core assembles minute by minute.

pub mod authority;

pub mod blocks;

pub mod crypto_primitives;

pub mod data_types;
