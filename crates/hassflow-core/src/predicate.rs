use crate::model::StateChange;

/// Wrap a change handler so it only fires when `predicate` switches from
/// false to true.
///
/// The first invocation seeds the "was true" memory from the change's
/// previous value.
///
/// ```
/// use hassflow_core::{StateValue, with_predicate};
///
/// let handler = with_predicate(
///     |v: &StateValue| v.as_f64().is_some_and(|t| t > 25.0),
///     |v, _| println!("too warm: {v}"),
/// );
/// # let _ = handler;
/// ```
pub fn with_predicate<T, P, H>(
    predicate: P,
    mut handler: H,
) -> impl FnMut(T, StateChange<T>) + Send
where
    P: Fn(&T) -> bool + Send,
    H: FnMut(T, StateChange<T>) + Send,
{
    let mut was: Option<bool> = None;
    move |value: T, change: StateChange<T>| {
        let before = *was.get_or_insert_with(|| predicate(&change.prev_state));
        let now = predicate(&value);
        was = Some(now);
        if now && !before {
            handler(value, change);
        }
    }
}
