// boundary.rs — Where a query ends inside a session.
//
// Convention: a timestep is a boundary when the token *fed at that step* is
// the end-of-query marker. The mask is 0.0 at a boundary step and 1.0
// elsewhere, and that single mask drives all three recurrent layers:
//
//   query encoder    reset  = mask  → carried state zeroed after the marker
//   session encoder  retain = mask  → session absorbs the finished query
//   decoder          retain = mask  → decoder restarts from the new session
//
// Token ids:   a  b  </q>  c  d
// Mask:        1  1   0    1  1

/// Decides whether a token closes a query.
pub trait BoundaryRule {
    fn is_boundary(&self, token: i64) -> bool;
}

/// The usual rule: equality against a fixed end-of-query id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfQuery {
    pub id: i64,
}

impl EndOfQuery {
    pub fn new(id: u32) -> Self {
        Self { id: id as i64 }
    }
}

impl BoundaryRule for EndOfQuery {
    fn is_boundary(&self, token: i64) -> bool {
        token == self.id
    }
}

impl<F> BoundaryRule for F
where
    F: Fn(i64) -> bool,
{
    fn is_boundary(&self, token: i64) -> bool {
        self(token)
    }
}

/// Build the reset/retain mask for a flat token buffer (any layout; the
/// output has the same layout).
pub fn boundary_mask<R: BoundaryRule + ?Sized>(tokens: &[i64], rule: &R) -> Vec<f32> {
    tokens
        .iter()
        .map(|&t| if rule.is_boundary(t) { 0.0 } else { 1.0 })
        .collect()
}
