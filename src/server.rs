//! Request boundary: the shared buffer clients exchange data through and the
//! size checks that happen before a request reaches the device.

use log::error;

use crate::error::{Error, Status};
use crate::serial_interface::SerialInterface;
use crate::storage::DeviceHandle;

/// Status code and amount processed of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<V> {
    pub status: Status,
    pub value: V,
}

impl<V> From<Result<V, Error>> for Reply<V>
where
    V: TryFrom<usize> + Default,
{
    fn from(result: Result<V, Error>) -> Self {
        match result {
            Ok(value) => Reply {
                status: Status::Success,
                value,
            },
            Err(err) => Reply {
                status: err.status(),
                value: V::try_from(err.processed()).unwrap_or_default(),
            },
        }
    }
}

/// Serves storage requests through a dataport of `N` bytes.
///
/// Writes take their data from the start of the dataport, reads leave it
/// there. A request larger than the dataport is refused as
/// [`Error::InvalidParameter`].
pub struct StorageServer<'a, I, const N: usize>
where
    I: SerialInterface,
{
    device: DeviceHandle<'a, I>,
    dataport: [u8; N],
}

impl<'a, I, const N: usize> StorageServer<'a, I, N>
where
    I: SerialInterface,
{
    pub fn new(device: DeviceHandle<'a, I>) -> Self {
        StorageServer {
            device,
            dataport: [0; N],
        }
    }

    pub fn device(&self) -> &DeviceHandle<'a, I> {
        &self.device
    }

    pub fn dataport(&self) -> &[u8; N] {
        &self.dataport
    }

    pub fn dataport_mut(&mut self) -> &mut [u8; N] {
        &mut self.dataport
    }

    fn check_request(&self, call: &str, size: usize) -> Result<(), Error> {
        if !self.device.is_ready() {
            error!("initialization failed, fail call {}()", call);
            return Err(Error::InvalidState);
        }
        if size > N {
            // clients know the dataport size and never ask for more
            error!("size {} exceeds dataport size {}", size, N);
            return Err(Error::InvalidParameter { size, capacity: N });
        }
        Ok(())
    }

    pub fn write(&mut self, offset: i64, size: usize) -> Result<usize, Error> {
        self.check_request("write", size)?;
        let offset = unsigned_offset(offset)?;
        self.device.write(offset, &self.dataport[..size])
    }

    pub fn read(&mut self, offset: i64, size: usize) -> Result<usize, Error> {
        self.check_request("read", size)?;
        let offset = unsigned_offset(offset)?;
        self.device.read(offset, &mut self.dataport[..size])
    }

    pub fn erase(&mut self, offset: i64, size: i64) -> Result<i64, Error> {
        self.device.erase(offset, size)
    }

    pub fn get_size(&mut self) -> Result<i64, Error> {
        self.device.size().map(i64::from)
    }

    pub fn get_state(&mut self) -> Result<u32, Error> {
        self.device.state_flags()
    }
}

fn unsigned_offset(offset: i64) -> Result<u64, Error> {
    u64::try_from(offset).map_err(|_| {
        error!("negative offset {}", offset);
        Error::OutOfBounds
    })
}
