use std::io;

/// Convert a C-style return code + `errno` into a Rust-style `io::Result`.
pub(crate) fn cvt(return_code: libc::c_int) -> io::Result<libc::c_int> {
    if return_code < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(return_code)
    }
}
