//! Scratch vectors and the column inputs operators read from.
//!
//! Operators never pass batches by value. A producer and its consumer share
//! a [`Vector`] (or a [`ColumnView`] into base data) wired up while the
//! per-thread operator tree is built; `next()` only reports how many leading
//! rows are valid.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::mem::{align_of, size_of};
use std::ops::Add;
use std::rc::Rc;
use std::sync::Arc;

use crate::hash::HashKey;
use crate::hashmap::EntryPtr;

/// Row position inside a batch or a column.
pub type Pos = u32;

/// Fixed-width values that can live in columns and hash table entries.
pub trait ColumnType:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + HashKey + 'static
{
}

impl ColumnType for i32 {}
impl ColumnType for i64 {}
impl ColumnType for u32 {}
impl ColumnType for u64 {}
impl ColumnType for f64 {}
impl<const N: usize> ColumnType for [u8; N] where [u8; N]: Default {}

/// Column types that can be aggregated.
pub trait Numeric: ColumnType + PartialOrd + Add<Output = Self> {
    const ZERO: Self;
    const MIN: Self;
    const MAX: Self;
}

macro_rules! impl_numeric {
    ($($t:ty),*) => {
        $(
            impl Numeric for $t {
                const ZERO: Self = 0;
                const MIN: Self = <$t>::MIN;
                const MAX: Self = <$t>::MAX;
            }
        )*
    };
}

impl_numeric!(i32, i64, u32, u64);

impl Numeric for f64 {
    const ZERO: Self = 0.0;
    const MIN: Self = f64::NEG_INFINITY;
    const MAX: Self = f64::INFINITY;
}

/// Byte size and alignment of `T` inside an entry.
pub(crate) fn layout_of<T>() -> (usize, usize) {
    (size_of::<T>(), align_of::<T>())
}

/// Read access to the current batch of a column.
pub trait Input<T> {
    /// Calls `f` with the batch; only the first `n` values reported by the
    /// producing operator are meaningful.
    fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R;
}

/// A scratch buffer shared between the operators of one thread.
pub struct Vector<T>(Rc<RefCell<Vec<T>>>);

impl<T> Clone for Vector<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: Clone> Vector<T> {
    pub fn filled(len: usize, value: T) -> Self {
        Self(Rc::new(RefCell::new(vec![value; len])))
    }
}

impl<T> Vector<T> {
    pub fn from_vec(values: Vec<T>) -> Self {
        Self(Rc::new(RefCell::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn borrow(&self) -> Ref<'_, Vec<T>> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Vec<T>> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: Copy> Vector<T> {
    /// Copy of the first `n` values.
    pub fn head(&self, n: usize) -> Vec<T> {
        self.0.borrow()[..n].to_vec()
    }
}

impl<T> Input<T> for Vector<T> {
    #[inline]
    fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.0.borrow())
    }
}

impl<T> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vector").field("len", &self.len()).finish()
    }
}

/// Zero-copy view into a base column, positioned by a scan cursor.
pub struct ColumnView<T> {
    data: Arc<Vec<T>>,
    cursor: Rc<Cell<usize>>,
}

impl<T> Clone for ColumnView<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            cursor: Rc::clone(&self.cursor),
        }
    }
}

impl<T> ColumnView<T> {
    pub(crate) fn new(data: Arc<Vec<T>>, cursor: Rc<Cell<usize>>) -> Self {
        Self { data, cursor }
    }
}

impl<T> Input<T> for ColumnView<T> {
    #[inline]
    fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let start = self.cursor.get().min(self.data.len());
        f(&self.data[start..])
    }
}

/// Hands out scratch vectors sized to the configured batch size.
pub struct VectorAllocator {
    vector_size: usize,
    allocated_bytes: usize,
}

impl VectorAllocator {
    pub fn new(vector_size: usize) -> Self {
        Self {
            vector_size,
            allocated_bytes: 0,
        }
    }

    pub fn vector_size(&self) -> usize {
        self.vector_size
    }

    pub fn get<T: Clone + Default>(&mut self) -> Vector<T> {
        self.get_sized(self.vector_size)
    }

    pub fn get_sized<T: Clone + Default>(&mut self, len: usize) -> Vector<T> {
        self.allocated_bytes += len * size_of::<T>();
        Vector::filled(len, T::default())
    }

    /// Vector of entry pointers, initialized to null.
    pub fn entries(&mut self) -> Vector<EntryPtr> {
        self.allocated_bytes += self.vector_size * size_of::<EntryPtr>();
        Vector::filled(self.vector_size, std::ptr::null_mut())
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}
