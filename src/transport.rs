//! Bus access primitives.
//!
//! The gauge hangs off either an i2c bus or the single-wire HDQ link. Both
//! expose the same small capability set so the rest of the driver is
//! written once; only the HDQ side needs the torn-read guard, since that
//! link can transfer no more than one byte at a time.

use byteorder::{ByteOrder, LittleEndian};
use embedded_hal_async::i2c;

use crate::Error;

/// Default i2c address of the gauge.
pub const I2C_ADDR: u8 = 0x55;

/// High-byte reads allowed before a 16-bit HDQ read is declared torn.
const HDQ_READ_RETRIES: usize = 3;

/// Byte-granular transfer primitives against the chip register file.
/// 16-bit quantities are little-endian on the wire.
#[allow(async_fn_in_trait)]
pub trait Bus {
    type Error;

    async fn read_byte(&mut self, reg: u8) -> Result<u8, Error<Self::Error>>;
    async fn read_word(&mut self, reg: u8) -> Result<u16, Error<Self::Error>>;
    async fn write_byte(&mut self, reg: u8, value: u8) -> Result<(), Error<Self::Error>>;
    async fn write_word(&mut self, reg: u8, value: u16) -> Result<(), Error<Self::Error>>;
    async fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), Error<Self::Error>>;
}

/// The regular i2c transport (bq27200/bq27500/bq27520).
pub struct I2cBus<I> {
    i2c: I,
    addr: u8,
}

impl<I> I2cBus<I> {
    pub fn new(i2c: I) -> Self {
        Self::with_address(i2c, I2C_ADDR)
    }

    pub fn with_address(i2c: I, addr: u8) -> Self {
        Self { i2c, addr }
    }
}

impl<I, E> Bus for I2cBus<I>
where
    I: i2c::I2c<Error = E>,
{
    type Error = E;

    async fn read_byte(&mut self, reg: u8) -> Result<u8, Error<E>> {
        let mut data = [0];
        self.i2c.write_read(self.addr, &[reg], &mut data).await?;
        Ok(data[0])
    }

    async fn read_word(&mut self, reg: u8) -> Result<u16, Error<E>> {
        let mut data = [0, 0];
        self.i2c.write_read(self.addr, &[reg], &mut data).await?;
        Ok(LittleEndian::read_u16(&data))
    }

    async fn write_byte(&mut self, reg: u8, value: u8) -> Result<(), Error<E>> {
        self.i2c.write(self.addr, &[reg, value]).await?;
        Ok(())
    }

    async fn write_word(&mut self, reg: u8, value: u16) -> Result<(), Error<E>> {
        let mut request = [reg, 0, 0];
        LittleEndian::write_u16(&mut request[1..], value);
        self.i2c.write(self.addr, &request).await?;
        Ok(())
    }

    async fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), Error<E>> {
        self.i2c.write_read(self.addr, &[reg], buf).await?;
        Ok(())
    }
}

/// Single-byte read primitive supplied by the board for an HDQ-attached
/// bq27000. The HDQ link has no write path.
#[allow(async_fn_in_trait)]
pub trait HdqRead {
    type Error;

    async fn read_register(&mut self, reg: u8) -> Result<u8, Self::Error>;
}

/// The HDQ transport. Only reads are possible; 16-bit values are assembled
/// from two byte reads with a guard against the counter advancing between
/// the two halves.
pub struct HdqBus<T> {
    link: T,
}

impl<T> HdqBus<T> {
    pub fn new(link: T) -> Self {
        Self { link }
    }
}

impl<T, E> Bus for HdqBus<T>
where
    T: HdqRead<Error = E>,
{
    type Error = E;

    async fn read_byte(&mut self, reg: u8) -> Result<u8, Error<E>> {
        Ok(self.link.read_register(reg).await?)
    }

    async fn read_word(&mut self, reg: u8) -> Result<u16, Error<E>> {
        // Re-read the high byte until it is stable so a low-byte overflow
        // between the two halves cannot produce a torn value.
        let mut upper = self.link.read_register(reg + 1).await?;

        for _ in 1..HDQ_READ_RETRIES {
            let lower = self.link.read_register(reg).await?;
            let confirm = self.link.read_register(reg + 1).await?;

            if confirm == upper {
                return Ok(u16::from(upper) << 8 | u16::from(lower));
            }

            upper = confirm;
        }

        Err(Error::TornRead)
    }

    async fn write_byte(&mut self, _reg: u8, _value: u8) -> Result<(), Error<E>> {
        Err(Error::Unsupported)
    }

    async fn write_word(&mut self, _reg: u8, _value: u16) -> Result<(), Error<E>> {
        Err(Error::Unsupported)
    }

    async fn read_block(&mut self, _reg: u8, _buf: &mut [u8]) -> Result<(), Error<E>> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    #[tokio::test]
    async fn i2c_words_are_little_endian() {
        let expectations = [
            Transaction::write_read(I2C_ADDR, vec![0x08], vec![0xD8, 0x0E]),
            Transaction::write(I2C_ADDR, vec![0x00, 0x41, 0x00]),
        ];
        let mut bus = I2cBus::new(Mock::new(&expectations));

        assert_eq!(bus.read_word(0x08).await.unwrap(), 3800);
        bus.write_word(0x00, 0x0041).await.unwrap();

        bus.i2c.done();
    }

    #[tokio::test]
    async fn i2c_block_read_is_a_single_burst() {
        let expectations = [Transaction::write_read(
            I2C_ADDR,
            vec![0x40],
            vec![1, 2, 3, 4],
        )];
        let mut bus = I2cBus::new(Mock::new(&expectations));

        let mut data = [0; 4];
        bus.read_block(0x40, &mut data).await.unwrap();
        assert_eq!(data, [1, 2, 3, 4]);

        bus.i2c.done();
    }

    /// Register file whose high byte changes on every read.
    struct FlippingLink {
        high_reads: usize,
    }

    impl HdqRead for FlippingLink {
        type Error = ();

        async fn read_register(&mut self, reg: u8) -> Result<u8, ()> {
            if reg & 1 != 0 {
                self.high_reads += 1;
                Ok(self.high_reads as u8)
            } else {
                Ok(0x42)
            }
        }
    }

    struct StableLink;

    impl HdqRead for StableLink {
        type Error = ();

        async fn read_register(&mut self, reg: u8) -> Result<u8, ()> {
            Ok(reg.wrapping_add(1))
        }
    }

    #[tokio::test]
    async fn hdq_word_assembles_high_then_low() {
        let mut bus = HdqBus::new(StableLink);
        // reg 0x16 -> low 0x17, high (0x17) -> 0x18
        assert_eq!(bus.read_word(0x16).await.unwrap(), 0x1817);
    }

    #[tokio::test]
    async fn hdq_torn_read_gives_up_after_three_high_reads() {
        let mut bus = HdqBus::new(FlippingLink { high_reads: 0 });

        assert_eq!(bus.read_word(0x16).await, Err(Error::TornRead));
        assert_eq!(bus.link.high_reads, 3);
    }

    #[tokio::test]
    async fn hdq_has_no_write_path() {
        let mut bus = HdqBus::new(StableLink);

        assert_eq!(bus.write_byte(0x3E, 0).await, Err(Error::Unsupported));
        assert_eq!(bus.write_word(0x00, 0x0041).await, Err(Error::Unsupported));
    }
}
