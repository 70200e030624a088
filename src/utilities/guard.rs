//! RAII guard that runs a given function on an owned item when it
//! drops out of scope.
//!
//! Useful for undoing host changes (addresses, mounts) no matter the
//! return path.
//!
//! Example
//! ```
//! # use dpu_provision_lib::utilities::guard::*;
//! let mut undone = Vec::new();
//! {
//!     let _guard = Guard::new(&mut undone, |log: &mut &mut Vec<&str>| log.push("undone"));
//! }
//! assert_eq!(undone, vec!["undone"]);
//! ```

pub struct Guard<T, G>
where
    G: FnOnce(&mut T),
{
    item: T,
    on_exit: Option<G>,
}

impl<T, G> Guard<T, G>
where
    G: FnOnce(&mut T),
{
    pub fn new(item: T, on_exit: G) -> Self { Self { item, on_exit: Some(on_exit) } }

    pub fn item(&self) -> &T { &self.item }
}

impl<T, G> Drop for Guard<T, G>
where
    G: FnOnce(&mut T),
{
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit(&mut self.item);
        }
    }
}
