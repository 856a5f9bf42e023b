use anyhow::{bail, Error};

pub fn strftime_local(format: &str, epoch: i64) -> Result<String, Error> {
    let format = std::ffi::CString::new(format)?;
    let epoch = epoch as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    if unsafe { libc::localtime_r(&epoch, &mut tm) }.is_null() {
        bail!("localtime_r failed");
    }
    let mut buf = [0u8; 256];
    let len = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            format.as_ptr(),
            &tm,
        )
    };
    if len == 0 {
        bail!("strftime failed");
    }
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}
