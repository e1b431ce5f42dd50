use std::path::Path;

use crate::commands::common::open_engine;
use crate::error::CliError;

pub async fn run_wipe(confirmed: bool, db_path: &Path) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::WipeNotConfirmed);
    }

    let engine = open_engine(db_path).await?;
    let pending = engine.queue().operations().await?.len();
    engine.wipe_local_data().await?;

    if pending > 0 {
        println!("Wiped local data ({pending} unsynced operation(s) discarded)");
    } else {
        println!("Wiped local data");
    }
    Ok(())
}
