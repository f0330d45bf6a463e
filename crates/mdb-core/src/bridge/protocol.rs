//! Bridge firmware protocol constants and tag enums.

use std::fmt;

pub const PROTOCOL_VERSION: u8 = 4;

pub const HEADER_FLAG_MASK: u8 = 0xf0;
pub const HEADER_VERSION_MASK: u8 = 0x0f;

/// Frame carries a payload.
pub const FLAG_PAYLOAD: u8 = 0x80;
/// Host acknowledges a frame / bridge has not consumed the last request.
pub const FLAG_REQUEST_BUSY: u8 = 0x40;

pub const PAD_OK: u8 = 0x33;
pub const PAD_ERROR: u8 = 0xee;

pub const BUFFER_SIZE: usize = 80;

/// Header, length and CRC.
pub const FRAME_OVERHEAD: usize = 3;
/// Minimum bytes the bridge appends after a frame: code byte and pads.
pub const PADDING_OVERHEAD: usize = 5;
pub const TOTAL_OVERHEAD: usize = FRAME_OVERHEAD + PADDING_OVERHEAD + 4;

/// Host-side acknowledgement prefix preceding the padding of a write.
pub const WRITE_ACK_LEN: usize = 6;

/// Defines a one-byte protocol tag with an `Unknown` catch-all.
macro_rules! byte_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant,)+
            Unknown(u8),
        }

        impl From<u8> for $name {
            fn from(b: u8) -> Self {
                match b {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                match v {
                    $($name::$variant => $value,)+
                    $name::Unknown(b) => b,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($text),)+
                    $name::Unknown(b) => write!(f, "{}?{:02x}", stringify!($name), b),
                }
            }
        }
    };
}

byte_enum! {
    /// Host to bridge commands.
    pub enum Command {
        Status = 0x01 => "STATUS",
        Config = 0x02 => "CONFIG",
        Reset = 0x03 => "RESET",
        Debug = 0x04 => "DEBUG",
        Flash = 0x05 => "FLASH",
        MdbBusReset = 0x07 => "MDB_BUS_RESET",
        MdbTransactionSimple = 0x08 => "MDB_TRANSACTION_SIMPLE",
        MdbTransactionCustom = 0x09 => "MDB_TRANSACTION_CUSTOM",
    }
}

byte_enum! {
    /// First payload byte of a bridge to host frame.
    pub enum Response {
        Ok = 0x01 => "OK",
        Reset = 0x02 => "RESET",
        TwiListen = 0x03 => "TWI_LISTEN",
        Error = 0x04 => "ERROR",
    }
}

byte_enum! {
    /// Tagged field inside a response payload.
    pub enum Field {
        Invalid = 0x00 => "INVALID",
        Protocol = 0x01 => "PROTOCOL",
        FirmwareVersion = 0x02 => "FIRMWARE_VERSION",
        ErrorN = 0x03 => "ERRORN",
        Error2 = 0x04 => "ERROR2",
        Mcusr = 0x05 => "MCUSR",
        Clock10u = 0x06 => "CLOCK10U",
        TwiAddr = 0x07 => "TWI_ADDR",
        TwiData = 0x08 => "TWI_DATA",
        MdbResult = 0x09 => "MDB_RESULT",
        MdbData = 0x0a => "MDB_DATA",
        MdbDuration10u = 0x0b => "MDB_DURATION10U",
    }
}

byte_enum! {
    /// Outcome of an MDB exchange performed by the bridge.
    pub enum MdbResult {
        Success = 0x01 => "SUCCESS",
        Busy = 0x02 => "BUSY",
        InvalidChk = 0x03 => "INVALID_CHK",
        Nak = 0x04 => "NAK",
        Timeout = 0x05 => "TIMEOUT",
        InvalidEnd = 0x06 => "INVALID_END",
        ReceiveOverflow = 0x07 => "RECEIVE_OVERFLOW",
        SendOverflow = 0x08 => "SEND_OVERFLOW",
        CodeError = 0x09 => "CODE_ERROR",
        UartReadUnexpected = 0x0a => "UART_READ_UNEXPECTED",
        UartReadError = 0x0b => "UART_READ_ERROR",
        UartReadOverflow = 0x0c => "UART_READ_OVERFLOW",
        UartReadParity = 0x0d => "UART_READ_PARITY",
        UartSendBusy = 0x0e => "UART_SEND_BUSY",
        UartTxcUnexpected = 0x0f => "UART_TXC_UNEXPECTED",
    }
}

byte_enum! {
    /// Error code carried in error padding or ERROR2 fields.
    pub enum Errcode {
        BufferOverflow = 0x01 => "BUFFER_OVERFLOW",
        FrameHeader = 0x02 => "FRAME_HEADER",
        InvalidCrc = 0x03 => "INVALID_CRC",
        InvalidData = 0x04 => "INVALID_DATA",
        UnknownCommand = 0x05 => "UNKNOWN_COMMAND",
        Corruption = 0x06 => "CORRUPTION",
        NotImplemented = 0x07 => "NOT_IMPLEMENTED",
        RequestOverwrite = 0x08 => "REQUEST_OVERWRITE",
        InvalidId = 0x09 => "INVALID_ID",
        Interrupt = 0x0a => "INTERRUPT",
        FrameLength = 0x0b => "FRAME_LENGTH",
    }
}

/// MCU reset cause bits reported in the MCUSR field.
pub mod reset_flag {
    pub const POWER_ON: u8 = 1 << 0;
    pub const EXTERNAL: u8 = 1 << 1;
    pub const BROWN_OUT: u8 = 1 << 2;
    pub const WATCHDOG: u8 = 1 << 3;
}

/// `+PO+EXT+BO+WD(PROBLEM)` style summary of reset cause bits.
pub fn mcusr_string(bits: u8) -> String {
    let mut s = String::new();
    if bits & reset_flag::POWER_ON != 0 {
        s.push_str("+PO");
    }
    if bits & reset_flag::EXTERNAL != 0 {
        s.push_str("+EXT");
    }
    if bits & reset_flag::BROWN_OUT != 0 {
        s.push_str("+BO");
    }
    if bits & reset_flag::WATCHDOG != 0 {
        s.push_str("+WD(PROBLEM)");
    }
    s
}
