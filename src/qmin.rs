use tracing::debug;

use crate::context::Frame;

/// Fallback applied when a minimized probe came back empty. Two cases,
/// keyed on whether the minimized name has already reached the full
/// name:
///
/// - it has: only the stand-in type is left to shed, so minimization
///   ends and the real type goes to the same server next,
/// - it has not: the probed name is promoted to the new minimization
///   depth, revealing one more label on the next query.
///
/// Either way the index steps back so the same server is asked again.
pub fn apply_fallback(frame: &mut Frame) {
    let question = &mut frame.question;
    let full = question.name.clone();
    match question.minimized_name().cloned() {
        Some(minimized) if minimized == full => {
            debug!(%question, "qname minimization exhausted, asking the real question");
            question.clear_minimization();
        }
        Some(minimized) => {
            debug!(%question, cut = %minimized, "promoting minimized name to zone cut");
            question.set_zone_cut(Some(minimized));
        }
        None => {}
    }
    frame.name_server_index = frame.name_server_index.saturating_sub(1);
}
