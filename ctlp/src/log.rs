// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! session_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SESSION,
            "unit" => UNIT_SESSION,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SESSION,
            "unit" => UNIT_SESSION,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SESSION,
            "unit" => UNIT_SESSION,
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SESSION,
            "unit" => UNIT_SESSION,
        )
    };
}

macro_rules! sync_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SYNC,
            "unit" => UNIT_SYNC,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SYNC,
            "unit" => UNIT_SYNC,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SYNC,
            "unit" => UNIT_SYNC,
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_CTLP,
            "module" => crate::MOD_SYNC,
            "unit" => UNIT_SYNC,
        )
    };
}

pub(crate) use {session_log, sync_log};
