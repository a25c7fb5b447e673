// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register-level PCI and PCI Express definitions shared by the root
//! complex model and the devices it talks to.

#![forbid(unsafe_code)]

pub mod spec;
