//! Macros for aborting on unrecoverable conditions.
//!
//! Geometry inconsistencies and unresolvable events indicate logic bugs,
//! not physical conditions, so they terminate the process after logging.
//! With the `for-testing` feature the macros panic instead, which lets
//! tests assert on the failure.

#[cfg(not(feature = "for-testing"))]
#[macro_export]
macro_rules! fatal {
    ($($print_arg:tt)*) => {{
        eprint!("[fatal] ");
        eprintln!($($print_arg)*);
        quit::with_code(1);
    }};
}

#[cfg(feature = "for-testing")]
#[macro_export]
macro_rules! fatal {
    ($($print_arg:tt)*) => {{
        panic!($($print_arg)*);
    }};
}

#[macro_export]
macro_rules! fatal_unless {
    ($logic:expr, $($print_arg:tt)*) => {
        if !($logic) {
            $crate::fatal!($($print_arg)*)
        }
    };
}

#[macro_export]
macro_rules! fatal_on_none {
    ($option:expr, $($print_arg:tt)*) => {
        match $option {
            Some(value) => value,
            None => $crate::fatal!($($print_arg)*),
        }
    };
}
