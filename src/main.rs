//! `/init` of the TNG Base initramfs.
//!
//! Takes no options: the kernel hands unknown command line words to init as
//! arguments, so argv is ignored and the command line is read from
//! `/proc/cmdline` instead.

use tng_init::{boot, failure, logger, BootConfig};

fn main() {
    let config = BootConfig::default();
    logger::init(&config.kmsg_path);

    match boot::run(&config) {
        Ok(never) => match never {},
        Err(e) => failure::fatal(e),
    }
}
