//! Accumulation of inbound payloads into per-consumer observable values.

/// Placeholder substituted for frames whose payload is missing or empty.
pub const UNKNOWN_EVENT_DATA: &str = "UNKNOWN_EVENT_DATA";

/// How a subscription folds inbound payloads into its observable value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccumulateMode {
    /// Keep only the most recent payload.
    #[default]
    Latest,
    /// Append every payload to an ordered list, in arrival order.
    List,
}

/// Observable value of a subscription once at least one frame arrived.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamValue {
    Latest(String),
    List(Vec<String>),
}

/// Folds one payload into the current value under the given mode.
///
/// A missing or empty payload is recorded as [`UNKNOWN_EVENT_DATA`]
/// rather than being dropped: the consumer still observes that an event
/// arrived.
pub fn accumulate(
    current: Option<StreamValue>,
    mode: AccumulateMode,
    payload: Option<&str>,
) -> StreamValue {
    let payload = match payload {
        Some(data) if !data.is_empty() => data.to_string(),
        _ => UNKNOWN_EVENT_DATA.to_string(),
    };

    match mode {
        AccumulateMode::Latest => StreamValue::Latest(payload),
        AccumulateMode::List => {
            let mut items = match current {
                Some(StreamValue::List(items)) => items,
                // First frame of the period, or a mode change that went
                // through reset: start a fresh list.
                Some(StreamValue::Latest(_)) | None => Vec::new(),
            };
            items.push(payload);
            StreamValue::List(items)
        }
    }
}
