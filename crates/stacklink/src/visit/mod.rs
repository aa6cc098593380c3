//! Visitors over template documents
mod visit_values;
pub use visit_values::{VisitKeysMut, VisitStringsMut};

/// Receives each visited node mutably
pub trait VisitMut<T: ?Sized> {
    fn visit_mut(&mut self, node: &mut T);
}

// closures are visitors
impl<T: ?Sized, F> VisitMut<T> for F
where
    F: FnMut(&mut T),
{
    fn visit_mut(&mut self, node: &mut T) {
        self(node)
    }
}
