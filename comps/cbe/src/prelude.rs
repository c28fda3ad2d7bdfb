// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error, Result},
    layers::bio::Block,
    os::{Arc, Mutex},
    return_errno, return_errno_with_msg,
    tree::{Generation, Hash, Pba, Vba},
};

pub(crate) use core::fmt::Debug;

pub(crate) use log::{debug, error, info, trace, warn};
