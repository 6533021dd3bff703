//! Interpreter struct layouts, described as data.
//!
//! All interpreter traversal decodes target records field-by-field at the
//! offsets recorded here; nothing is cast to host structs. The table is
//! keyed by the interpreter's major.minor version so that further layouts
//! are additions, not code changes. CPython 2.7 on x86-64 is the layout the
//! printers currently understand.

/// Field offsets (bytes into the target record) and constants for one
/// interpreter version.
pub struct PyLayouts {
    /// PyObject / PyVarObject header.
    pub object_type: usize,
    pub varobject_size: usize,

    /// PyTypeObject.
    pub type_name: usize,
    pub type_basicsize: usize,
    pub type_itemsize: usize,
    pub type_flags: usize,
    pub type_dictoffset: usize,
    pub tpflags_heaptype: u64,

    /// Concrete object bodies.
    pub string_sval: usize,
    pub int_ival: usize,
    pub float_fval: usize,
    pub long_digit: usize,
    pub long_shift: u32,
    pub list_item: usize,
    pub dict_used: usize,
    pub dict_mask: usize,
    pub dict_table: usize,
    pub dictentry_size: usize,
    pub dictentry_key: usize,
    pub dictentry_value: usize,
    pub tuple_item: usize,
    pub class_name: usize,
    pub instance_class: usize,
    pub instance_dict: usize,

    /// Frames and code objects.
    pub frame_back: usize,
    pub frame_code: usize,
    pub frame_locals: usize,
    pub frame_lasti: usize,
    pub frame_localsplus: usize,
    pub code_nlocals: usize,
    pub code_varnames: usize,
    pub code_freevars: usize,
    pub code_cellvars: usize,
    pub code_filename: usize,
    pub code_name: usize,
    pub code_firstlineno: usize,
    pub code_lnotab: usize,

    /// Thread and interpreter state chains.
    pub tstate_next: usize,
    pub tstate_frame: usize,
    pub tstate_thread_id: usize,
    pub interp_next: usize,
    pub interp_tstate_head: usize,
}

pub static PY27: PyLayouts = PyLayouts {
    object_type: 8,
    varobject_size: 16,

    type_name: 24,
    type_basicsize: 32,
    type_itemsize: 40,
    type_flags: 168,
    type_dictoffset: 288,
    tpflags_heaptype: 1 << 9,

    string_sval: 36,
    int_ival: 16,
    float_fval: 16,
    long_digit: 24,
    long_shift: 30,
    list_item: 24,
    dict_used: 24,
    dict_mask: 32,
    dict_table: 40,
    dictentry_size: 24,
    dictentry_key: 8,
    dictentry_value: 16,
    tuple_item: 24,
    class_name: 32,
    instance_class: 16,
    instance_dict: 24,

    frame_back: 24,
    frame_code: 32,
    frame_locals: 56,
    frame_lasti: 120,
    frame_localsplus: 376,
    code_nlocals: 20,
    code_varnames: 56,
    code_freevars: 64,
    code_cellvars: 72,
    code_filename: 80,
    code_name: 88,
    code_firstlineno: 96,
    code_lnotab: 104,

    tstate_next: 0,
    tstate_frame: 16,
    tstate_thread_id: 144,
    interp_next: 0,
    interp_tstate_head: 8,
};

/// Pick the layout for a detected interpreter version ("2.7", "2.6", ...).
pub fn for_version(version: &str) -> Option<&'static PyLayouts> {
    match version {
        "2.7" => Some(&PY27),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions_resolve() {
        assert!(for_version("2.7").is_some());
        assert!(for_version("3.11").is_none());
    }
}
