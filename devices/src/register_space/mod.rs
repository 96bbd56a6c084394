// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Declarative MMIO register blocks. Devices describe their registers once and route guest
//! accesses through a `RegisterSpace`.

#[macro_use]
mod register;
mod register_space;

pub use self::register::*;
pub use self::register_space::*;
