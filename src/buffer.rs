/// Resize a reusable scratch buffer without preserving contents.
///
/// The engine keeps its column, accumulator and quantized-input buffers
/// alive across invocations; steady-state runs on a fixed shape never
/// reallocate.
pub fn ensure_capacity<T: Copy + Default>(v: &mut Vec<T>, len: usize) {
    if v.len() != len {
        v.clear();
        v.resize(len, T::default());
    }
}
