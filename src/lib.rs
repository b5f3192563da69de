/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod errors;
pub mod execution_modes;
pub mod gateway;
pub mod manifest;
pub mod provision;
pub mod reduce;
pub mod report;
pub mod result_log;
pub mod sandbox;
pub mod sweep;
