//! Provides an immutable carrier for cached values.
//!
//! All values handed out by a [Group](crate::group::Group) are wrapped into a [ByteView]. A view
//! is a read-only window onto the bytes which were obtained from an origin loader or a peer.
//! Views are cheap to clone (the underlying buffer is shared), therefore the cache can keep one
//! copy around while handing further ones to any number of concurrent readers - none of which can
//! modify the underlying data.
//!
//! By storing plain bytes instead of strings, a cache can hold arbitrary blobs (serialized
//! objects, images, ...) without imposing any encoding on its users.
use crate::lru::ByteSize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Wraps a byte sequence into an immutable and cheaply cloneable view.
///
/// # Examples
/// ```
/// # use ganymede::view::ByteView;
/// let view = ByteView::from("hello".as_bytes());
///
/// assert_eq!(view.len(), 5);
/// assert_eq!(view.to_vec(), "hello".as_bytes());
/// assert_eq!(view.to_string(), "hello");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Arc<[u8]>,
}

impl ByteView {
    /// Returns the number of bytes within this view.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if this view contains any data at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of the underlying bytes.
    ///
    /// Note that this is a detached copy on purpose: the returned buffer can be modified at will
    /// without ever affecting the data kept in the cache.
    ///
    /// # Examples
    /// ```
    /// # use ganymede::view::ByteView;
    /// let view = ByteView::from(vec![1, 2, 3]);
    ///
    /// let mut bytes = view.to_vec();
    /// bytes[0] = 42;
    ///
    /// // The view itself remains untouched...
    /// assert_eq!(view.to_vec(), vec![1, 2, 3]);
    /// ```
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(bytes: Vec<u8>) -> Self {
        ByteView { data: bytes.into() }
    }
}

impl From<&[u8]> for ByteView {
    fn from(bytes: &[u8]) -> Self {
        ByteView {
            data: Arc::from(bytes),
        }
    }
}

impl Display for ByteView {
    /// Renders the underlying bytes as a string, replacing invalid UTF-8 sequences.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::ByteSize;
    use crate::view::ByteView;

    #[test]
    fn a_view_exposes_its_length_and_contents() {
        let view = ByteView::from("634".as_bytes());
        assert_eq!(view.len(), 3);
        assert_eq!(view.is_empty(), false);
        assert_eq!(view.allocated_size(), 3);
        assert_eq!(view.to_vec(), b"634".to_vec());
        assert_eq!(view.to_string(), "634");

        let view = ByteView::from(Vec::new());
        assert_eq!(view.len(), 0);
        assert_eq!(view.is_empty(), true);
    }

    #[test]
    fn copies_are_detached_from_the_view() {
        let view = ByteView::from(vec![1, 2, 3, 4]);

        // Modifying the copy returned by to_vec...
        let mut copy = view.to_vec();
        copy[0] = 99;
        copy.clear();

        // ...never shines through to the view or any of its clones.
        assert_eq!(view.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(view.clone().to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn clones_share_their_contents() {
        let view = ByteView::from("shared".as_bytes());
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.to_string(), "shared");
    }
}
