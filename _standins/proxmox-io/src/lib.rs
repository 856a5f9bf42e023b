use std::io;
use std::mem::MaybeUninit;

use endian_trait::Endian;

pub mod vec {
    pub unsafe fn uninitialized(len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        out.set_len(len);
        out
    }

    pub fn undefined(len: usize) -> Vec<u8> {
        unsafe { uninitialized(len) }
    }
}

pub trait ReadExt {
    fn read_exact_allocated(&mut self, size: usize) -> io::Result<Vec<u8>>;
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool>;
    unsafe fn read_host_value<T>(&mut self) -> io::Result<T>
    where
        Self: Sized;
    unsafe fn read_le_value<T: Endian>(&mut self) -> io::Result<T>
    where
        Self: Sized;
}

impl<R: io::Read> ReadExt for R {
    fn read_exact_allocated(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut out = vec::undefined(size);
        self.read_exact(&mut out)?;
        Ok(out)
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut read_bytes = 0;
        loop {
            match self.read(&mut buf[read_bytes..]) {
                Ok(0) => {
                    if read_bytes == 0 {
                        return Ok(false);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF in the middle of a data item",
                    ));
                }
                Ok(count) => {
                    read_bytes += count;
                    if read_bytes == buf.len() {
                        return Ok(true);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    unsafe fn read_host_value<T>(&mut self) -> io::Result<T>
    where
        Self: Sized,
    {
        let mut value = MaybeUninit::<T>::uninit();
        self.read_exact(std::slice::from_raw_parts_mut(
            value.as_mut_ptr() as *mut u8,
            std::mem::size_of::<T>(),
        ))?;
        Ok(value.assume_init())
    }

    unsafe fn read_le_value<T: Endian>(&mut self) -> io::Result<T>
    where
        Self: Sized,
    {
        Ok(self.read_host_value::<T>()?.from_le())
    }
}

pub trait WriteExt {
    unsafe fn write_host_value<T>(&mut self, value: T) -> io::Result<()>
    where
        Self: Sized;
    unsafe fn write_le_value<T: Endian>(&mut self, value: T) -> io::Result<()>
    where
        Self: Sized;
}

impl<W: io::Write> WriteExt for W {
    unsafe fn write_host_value<T>(&mut self, value: T) -> io::Result<()>
    where
        Self: Sized,
    {
        self.write_all(std::slice::from_raw_parts(
            &value as *const T as *const u8,
            std::mem::size_of::<T>(),
        ))
    }

    unsafe fn write_le_value<T: Endian>(&mut self, value: T) -> io::Result<()>
    where
        Self: Sized,
    {
        self.write_host_value(value.to_le())
    }
}
