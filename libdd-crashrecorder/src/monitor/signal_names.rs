// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal and signal code naming.

use anyhow::Context;
use nix::sys::signal::Signal;

const FATAL_SIGNALS: [libc::c_int; 8] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTRAP,
];

/// Signals that end the process by default and are worth a report.
pub fn fatal_signals() -> &'static [libc::c_int] {
    &FATAL_SIGNALS
}

pub fn signal_from_signum(signum: libc::c_int) -> anyhow::Result<Signal> {
    Signal::try_from(signum).with_context(|| format!("Unexpected signal number {signum}"))
}

/// `"SIGSEGV"` and friends. `None` for numbers without a standard name.
pub fn signal_name(signum: libc::c_int) -> Option<&'static str> {
    Signal::try_from(signum).ok().map(Signal::as_str)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::sigcode_name;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;

    // Linux values, see <https://man7.org/linux/man-pages/man2/sigaction.2.html>.

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum SegvCode {
        SEGV_MAPERR = 1,
        SEGV_ACCERR = 2,
        SEGV_BNDERR = 3,
        SEGV_PKUERR = 4,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum BusCode {
        BUS_ADRALN = 1,
        BUS_ADRERR = 2,
        BUS_OBJERR = 3,
        BUS_MCEERR_AR = 4,
        BUS_MCEERR_AO = 5,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum IllCode {
        ILL_ILLOPC = 1,
        ILL_ILLOPN = 2,
        ILL_ILLADR = 3,
        ILL_ILLTRP = 4,
        ILL_PRVOPC = 5,
        ILL_PRVREG = 6,
        ILL_COPROC = 7,
        ILL_BADSTK = 8,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum FpeCode {
        FPE_INTDIV = 1,
        FPE_INTOVF = 2,
        FPE_FLTDIV = 3,
        FPE_FLTOVF = 4,
        FPE_FLTUND = 5,
        FPE_FLTRES = 6,
        FPE_FLTINV = 7,
        FPE_FLTSUB = 8,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum TrapCode {
        TRAP_BRKPT = 1,
        TRAP_TRACE = 2,
    }

    /// Codes any signal may carry when it was sent rather than raised by a fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
    #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
    enum SenderCode {
        SI_USER = 0,
        SI_KERNEL = 0x80,
        SI_QUEUE = -1,
        SI_TIMER = -2,
        SI_MESGQ = -3,
        SI_ASYNCIO = -4,
        SI_SIGIO = -5,
        SI_TKILL = -6,
    }

    macro_rules! code_name {
        ($ty:ty, $code:expr, $($name:ident),+) => {
            <$ty>::from_i32($code).map(|code| match code { $(<$ty>::$name => stringify!($name)),+ })
        };
    }

    /// Symbolic name of `sigcode` as delivered with `signum`.
    pub fn sigcode_name(signum: libc::c_int, sigcode: libc::c_int) -> Option<&'static str> {
        let specific = match signum {
            libc::SIGSEGV => code_name!(SegvCode, sigcode, SEGV_MAPERR, SEGV_ACCERR, SEGV_BNDERR, SEGV_PKUERR),
            libc::SIGBUS => code_name!(
                BusCode, sigcode, BUS_ADRALN, BUS_ADRERR, BUS_OBJERR, BUS_MCEERR_AR, BUS_MCEERR_AO
            ),
            libc::SIGILL => code_name!(
                IllCode, sigcode, ILL_ILLOPC, ILL_ILLOPN, ILL_ILLADR, ILL_ILLTRP, ILL_PRVOPC,
                ILL_PRVREG, ILL_COPROC, ILL_BADSTK
            ),
            libc::SIGFPE => code_name!(
                FpeCode, sigcode, FPE_INTDIV, FPE_INTOVF, FPE_FLTDIV, FPE_FLTOVF, FPE_FLTUND,
                FPE_FLTRES, FPE_FLTINV, FPE_FLTSUB
            ),
            libc::SIGTRAP => code_name!(TrapCode, sigcode, TRAP_BRKPT, TRAP_TRACE),
            _ => None,
        };
        // Fault codes are positive and small, so a sender code never shadows one.
        specific.or_else(|| {
            code_name!(
                SenderCode, sigcode, SI_USER, SI_KERNEL, SI_QUEUE, SI_TIMER, SI_MESGQ, SI_ASYNCIO,
                SI_SIGIO, SI_TKILL
            )
        })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn sigcode_name(_signum: libc::c_int, sigcode: libc::c_int) -> Option<&'static str> {
    (sigcode == 0).then_some("SI_USER")
}
