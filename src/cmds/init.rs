// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand to create the database.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Directory holding the database and pid file.
    #[bpaf(argument("PATH"), fallback(crate::DEFAULT_VAR_DIR.into()), debug_fallback)]
    var_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    std::fs::create_dir_all(&args.var_dir)?;
    let mut conn = super::open_conn(&args.var_dir, super::OpenMode::Create)?;
    db::db::init(&mut conn)?;
    info!(
        "database initialized at {}",
        args.var_dir.join("lightnvr.db").display()
    );
    Ok(0)
}
