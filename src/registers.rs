// Address -> typed entry dispatch table for everything the host can touch
//
// Entries are added once while the firmware is assembled and the map is
// shared read-only afterwards. Each entry owns its (de)serialization through
// the `Wire` trait, the map itself only checks kinds and byte counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

/// Fixed-size little-endian representation used on the wire
pub trait Wire: Sized {
    const SIZE: usize;

    fn write_to(&self, out: &mut Vec<u8>);

    /// `bytes` holds at least `SIZE` bytes
    fn read_from(bytes: &[u8]) -> Self;

    fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut out);
        out
    }
}

macro_rules! impl_wire_primitive {
    ($($ty:ty),*) => {
        $(
            impl Wire for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_primitive!(u8, i8, u16, i16, u32, i32, f32);

impl Wire for bool {
    const SIZE: usize = 1;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn read_from(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Wire for () {
    const SIZE: usize = 0;

    fn write_to(&self, _out: &mut Vec<u8>) {}

    fn read_from(_bytes: &[u8]) -> Self {}
}

impl<T: Wire, const N: usize> Wire for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn write_to(&self, out: &mut Vec<u8>) {
        for item in self {
            item.write_to(out);
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        std::array::from_fn(|i| T::read_from(&bytes[i * T::SIZE..]))
    }
}

/// Sequential reader for composite `Wire` implementations
pub struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn take<T: Wire>(&mut self) -> T {
        let value = T::read_from(&self.bytes[self.pos..]);
        self.pos += T::SIZE;
        value
    }
}

/// Access class of a register entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum RegisterKind {
    Executable = 1,
    Writable = 2,
    Readable = 3,
    ReadWrite = 4,
}

impl RegisterKind {
    pub fn is_readable(self) -> bool {
        matches!(self, RegisterKind::Readable | RegisterKind::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Writable | RegisterKind::ReadWrite)
    }
}

/// A single addressable entry. Methods that don't apply to the entry's kind,
/// or get input of the wrong size, are no-ops.
pub trait RegisterEntry: Send + Sync {
    fn kind(&self) -> RegisterKind;

    fn input_size(&self) -> usize {
        0
    }

    fn output_size(&self) -> usize {
        0
    }

    fn write(&self, _input: &[u8]) {}

    fn read(&self, _out: &mut Vec<u8>) {}

    fn execute(&self, _input: &[u8], _out: &mut Vec<u8>) {}
}

type Getter<T> = Box<dyn Fn() -> T + Send + Sync>;
type Setter<T> = Box<dyn Fn(T) + Send + Sync>;
type Callback<I, O> = Box<dyn Fn(I) -> O + Send + Sync>;

/// Data entry bound to a getter and/or setter
pub struct Property<T> {
    kind: RegisterKind,
    get: Option<Getter<T>>,
    set: Option<Setter<T>>,
}

impl<T: Wire + 'static> Property<T> {
    pub fn readable(get: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            kind: RegisterKind::Readable,
            get: Some(Box::new(get)),
            set: None,
        }
    }

    pub fn writable(set: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            kind: RegisterKind::Writable,
            get: None,
            set: Some(Box::new(set)),
        }
    }

    pub fn read_write(
        get: impl Fn() -> T + Send + Sync + 'static,
        set: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: RegisterKind::ReadWrite,
            get: Some(Box::new(get)),
            set: Some(Box::new(set)),
        }
    }

    /// Read-write entry backed directly by a shared value
    pub fn shared(value: Arc<Mutex<T>>) -> Self
    where
        T: Copy + Send,
    {
        let reader = Arc::clone(&value);
        Self::read_write(move || *reader.lock(), move |v| *value.lock() = v)
    }
}

impl<T: Wire + 'static> RegisterEntry for Property<T> {
    fn kind(&self) -> RegisterKind {
        self.kind
    }

    fn input_size(&self) -> usize {
        if self.set.is_some() { T::SIZE } else { 0 }
    }

    fn output_size(&self) -> usize {
        if self.get.is_some() { T::SIZE } else { 0 }
    }

    fn write(&self, input: &[u8]) {
        if let Some(set) = &self.set
            && input.len() == T::SIZE
        {
            set(T::read_from(input));
        }
    }

    fn read(&self, out: &mut Vec<u8>) {
        if let Some(get) = &self.get {
            get().write_to(out);
        }
    }
}

/// Executable entry. An unbound function is addressable but produces no output.
pub struct Function<I, O> {
    callback: Option<Callback<I, O>>,
}

impl<I: Wire + 'static, O: Wire + 'static> Function<I, O> {
    pub fn new(callback: impl Fn(I) -> O + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn unbound() -> Self {
        Self { callback: None }
    }
}

impl<I: Wire + 'static, O: Wire + 'static> RegisterEntry for Function<I, O> {
    fn kind(&self) -> RegisterKind {
        RegisterKind::Executable
    }

    fn input_size(&self) -> usize {
        I::SIZE
    }

    fn output_size(&self) -> usize {
        O::SIZE
    }

    fn execute(&self, input: &[u8], out: &mut Vec<u8>) {
        if let Some(callback) = &self.callback
            && input.len() == I::SIZE
        {
            callback(I::read_from(input)).write_to(out);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("Register 0x{address:04X} already registered in module 0x{module:02X}")]
    DuplicateAddress { module: u8, address: u16 },
}

/// Register table for one module address
pub struct RegisterMap {
    module: u8,
    entries: BTreeMap<u16, Box<dyn RegisterEntry>>,
}

impl RegisterMap {
    pub fn new(module: u8) -> Self {
        Self {
            module,
            entries: BTreeMap::new(),
        }
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an entry; an occupied address is rejected
    pub fn add(&mut self, address: u16, entry: impl RegisterEntry + 'static) -> Result<(), RegisterError> {
        if self.entries.contains_key(&address) {
            return Err(RegisterError::DuplicateAddress {
                module: self.module,
                address,
            });
        }
        self.entries.insert(address, Box::new(entry));
        Ok(())
    }

    pub fn get(&self, address: u16) -> Option<&dyn RegisterEntry> {
        self.entries.get(&address).map(|entry| entry.as_ref())
    }

    /// Returns true if the value was stored
    pub fn write(&self, address: u16, input: &[u8]) -> bool {
        match self.get(address) {
            Some(entry) if entry.kind().is_writable() && input.len() == entry.input_size() => {
                entry.write(input);
                true
            }
            _ => false,
        }
    }

    /// Appends the value to `out` and returns its length, 0 if not readable
    pub fn read(&self, address: u16, out: &mut Vec<u8>) -> usize {
        match self.get(address) {
            Some(entry) if entry.kind().is_readable() => {
                let start = out.len();
                entry.read(out);
                out.len() - start
            }
            _ => 0,
        }
    }

    /// Runs an executable entry and returns the output length, 0 if the input
    /// size does not match. The channel answers LEN before it gets here.
    pub fn execute(&self, address: u16, input: &[u8], out: &mut Vec<u8>) -> usize {
        match self.get(address) {
            Some(entry) if entry.kind() == RegisterKind::Executable => {
                let start = out.len();
                entry.execute(input, out);
                out.len() - start
            }
            _ => 0,
        }
    }
}
