/// A terse, single-line summary of a message, for tracing.
///
/// `Debug` output of entry payloads can be arbitrarily large; summaries keep log lines bounded.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
