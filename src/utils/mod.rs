mod idalloc;

pub use idalloc::IdAlloc;
