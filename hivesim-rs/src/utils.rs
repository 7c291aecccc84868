use rand::Rng;
use std::any::Any;
use std::sync::Once;
use std::time::Duration;

/// Ensures that 'name' contains the client type.
pub fn client_test_name(name: &str, client_type: &str) -> String {
    if name.is_empty() {
        return client_type.to_string();
    }
    if name.contains("CLIENT") {
        return name.replace("CLIENT", client_type);
    }
    format!("{} ({})", name, client_type)
}

/// Panic payload used by `Test::fatal` to leave a test body early.
#[derive(Debug)]
pub(crate) struct Fatal;

/// Translates the outcome of a test body into failure details. `None` means
/// the body finished, or left through `Test::fatal` which has already
/// recorded its failure.
pub fn extract_test_results(outcome: Result<(), Box<dyn Any + Send>>) -> Option<String> {
    match outcome {
        Ok(()) => None,
        Err(err) => {
            if err.is::<Fatal>() {
                return None;
            }
            let err = if let Some(err) = err.downcast_ref::<&'static str>() {
                err.to_string()
            } else if let Some(err) = err.downcast_ref::<String>() {
                err.clone()
            } else {
                format!("?{:?}", err)
            };
            Some(format!("panic: {err}"))
        }
    }
}

/// Keeps the default panic hook quiet for `Test::fatal` unwinds.
pub(crate) fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<Fatal>() {
                return;
            }
            previous(info)
        }));
    });
}

/// Random pause of 100-300ms before retrying a host request.
pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(100..=300))
}
