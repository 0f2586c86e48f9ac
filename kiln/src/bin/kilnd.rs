/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! The kiln daemon: boots the runtime from a module specification document
//! and serves until signaled. Exits -1 on any fatal startup error.

use std::path::Path;
use std::process;

use log::{error, info};

use kiln::Runtime;

fn usage(program: &str) {
    eprintln!("usage: {} <modules.json>", program);
}

fn main() {
    env_logger::init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "kilnd".to_string());
    let Some(modules_path) = args.next() else {
        usage(&program);
        process::exit(-1);
    };
    if args.next().is_some() {
        usage(&program);
        process::exit(-1);
    }

    info!("initializing the runtime");
    let runtime = match Runtime::boot(Path::new(&modules_path)) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("{}", err);
            process::exit(-1);
        }
    };

    if let Err(err) = runtime.serve() {
        error!("{}", err);
        process::exit(-1);
    }
}
