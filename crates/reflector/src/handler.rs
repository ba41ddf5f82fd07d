/// Observer of the transitions a reflector detects. Every method defaults to a no-op.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &T) {}
    fn on_update(&self, _old: &T, _new: &T) {}
    fn on_delete(&self, _obj: &T) {}
}

/// Handler that ignores everything; stands in when no observer is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl<T> EventHandler<T> for NoopHandler {}

type ObjFn<T> = Box<dyn Fn(&T) + Send + Sync>;
type PairFn<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// Callback set with each of add/update/delete optional.
///
/// ```
/// use mirra_reflector::{EventHandler, Handlers};
///
/// let h = Handlers::<String>::new().add_fn(|s| println!("+ {s}"));
/// h.on_add(&"x".to_string());
/// h.on_delete(&"x".to_string()); // unset: no-op
/// ```
pub struct Handlers<T> {
    add: Option<ObjFn<T>>,
    update: Option<PairFn<T>>,
    delete: Option<ObjFn<T>>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<T> Handlers<T> {
    pub fn new() -> Self { Self::default() }

    pub fn add_fn(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn update_fn(mut self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn delete_fn(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T> EventHandler<T> for Handlers<T> {
    fn on_add(&self, obj: &T) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &T, new: &T) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &T) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}
