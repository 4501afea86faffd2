//! Internal events: registered metric handles paired with a tracing record.
//!
//! Each event is registered once (usually when a limiter is built) and emitted many
//! times, so the metric keys are resolved only once per limiter.

/// Declares an event type holding pre-registered metric handles.
///
/// ```ignore
/// registered_event! {
///     MyEvent { instance: u64 } => {
///         hits: Counter = counter!("hits_total", "instance" => instance.to_string()),
///     }
///
///     fn emit(&self, count: u64) {
///         self.hits.increment(count);
///     }
/// }
/// ```
macro_rules! registered_event {
    (
        $event:ident { $($tag:ident: $tag_ty:ty),* $(,)? } => {
            $($field:ident: $field_ty:ty = $value:expr,)*
        }

        fn emit(&$slf:ident, $data:ident: $data_ty:ty) $body:block
    ) => {
        #[derive(Clone)]
        pub(crate) struct $event {
            $($field: $field_ty,)*
        }

        impl $event {
            pub(crate) fn register($($tag: $tag_ty),*) -> Self {
                Self {
                    $($field: $value,)*
                }
            }

            pub(crate) fn emit(&$slf, $data: $data_ty) $body
        }
    };
}

pub(crate) use registered_event;

mod rate_limit;

pub(crate) use rate_limit::*;
