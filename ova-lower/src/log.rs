// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! lower_log {
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_FLOWS,
            "unit" => UNIT_SINK,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_FLOWS,
            "unit" => UNIT_SINK,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_FLOWS,
            "unit" => UNIT_SINK,
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_FLOWS,
            "unit" => UNIT_SINK,
        )
    };
}

macro_rules! sched_log {
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_SCHEDULER,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_SCHEDULER,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_SCHEDULER,
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_OVA_LOWER,
            "module" => crate::MOD_SCHEDULER,
        )
    };
}

pub(crate) use {lower_log, sched_log};
