mod min_heap;
pub(crate) use min_heap::MinHeap;
