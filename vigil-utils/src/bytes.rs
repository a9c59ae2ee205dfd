//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cell::RefCell;

use bytes::BytesMut;

// Scratch buffer shared by all packet encoders running on the same thread.
//
// Encoding always starts by clearing the buffer, so the capacity is reused
// across packets instead of being reallocated for every transmission.
thread_local!(
    pub static TLS_BUF: RefCell<BytesMut> =
        RefCell::new(BytesMut::with_capacity(65536))
);
