use std::io;

/// Converts a C return value to a Rust `Result`.
///
/// `libibverbs` reports failures either as a negative return value or as a
/// positive errno, depending on the call.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(io::Error::from_raw_os_error(ret.abs())),
    }
}

/// Converts a C return value to a Rust `Result`, replacing well-known error
/// codes with a more readable message.
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let errno = ret.abs();
    let err = io::Error::from_raw_os_error(errno);
    match f(errno) {
        Some(msg) => Err(io::Error::new(err.kind(), msg)),
        None => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_ret() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(from_c_ret(-22).unwrap_err().raw_os_error(), Some(22));
        assert_eq!(from_c_ret(22).unwrap_err().raw_os_error(), Some(22));

        let err = from_c_ret_explained(110, |_| Some("timed out")).unwrap_err();
        assert_eq!(err.to_string(), "timed out");
    }
}
