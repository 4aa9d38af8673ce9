//! Colored console logging helpers used across the crate.

use color_print::cprintln;

pub fn info(message: &str) {
    cprintln!("<green, bold>info:</green, bold> {}", message);
}

pub fn error(message: &str) {
    cprintln!("<red, bold>error:</red, bold> {}", message);
}

pub fn debug(message: &str) {
    cprintln!("<blue, bold>debug:</blue, bold> {}", message);
}
