//! Digital I/O helpers.

use tracing::debug;

use crate::board::Board;

/// Consecutive high reads needed before the line counts as released by
/// every participant.
const SYNC_DEBOUNCE: u8 = 20;

/// Waits until every controller on the synchronisation line has released
/// it, then pulls it low again.
pub fn synchronize<B: Board>(board: &mut B) {
    board.release_sync(true);

    let mut counter = 0u8;
    loop {
        if board.sync_line() {
            counter += 1;
        } else {
            counter = 0;
        }
        if counter > SYNC_DEBOUNCE {
            break;
        }
    }
    debug!("Synchronized");

    // Give the others a chance to see the high level
    board.delay_ms(20);

    board.release_sync(false);
}
