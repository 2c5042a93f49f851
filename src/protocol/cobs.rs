// Consistent Overhead Byte Stuffing
//
// Every zero byte of the payload is replaced by a code byte holding the
// distance to the next zero, so the encoded frame is free of zeros and a
// single 0x00 can terminate it on the wire.
//
// Example: [0x11, 0x00, 0x22] -> [0x02, 0x11, 0x02, 0x22]

/// Frame delimiter appended after an encoded frame on the wire
pub const DELIMITER: u8 = 0x00;

/// Longest run of non-zero bytes a single code byte can describe
const MAX_BLOCK: u8 = 0xFF;

/// Worst-case encoded size for a payload of `len` bytes (without delimiter)
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Encode `data` into `out`, returning the number of bytes written.
///
/// Returns 0 if `out` cannot hold the worst-case encoding. Nothing is
/// allocated; runs longer than 254 non-zero bytes are split into 0xFF blocks.
pub fn encode_into(data: &[u8], out: &mut [u8]) -> usize {
    if out.len() < max_encoded_len(data.len()) {
        return 0;
    }

    let mut code_index = 0;
    let mut write = 1;
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_index] = code;
            code_index = write;
            write += 1;
            code = 1;
        } else {
            out[write] = byte;
            write += 1;
            code += 1;
            if code == MAX_BLOCK {
                out[code_index] = code;
                code_index = write;
                write += 1;
                code = 1;
            }
        }
    }

    out[code_index] = code;
    write
}

/// Decode one frame from `frame` into `out`, returning the payload length.
///
/// Decoding stops at the first delimiter or at the end of `frame`. Degenerate
/// input (a code pointing past the frame, an embedded zero, or an undersized
/// `out`) yields 0.
pub fn decode_into(frame: &[u8], out: &mut [u8]) -> usize {
    let mut read = 0;
    let mut write = 0;

    while read < frame.len() {
        let code = frame[read];
        if code == DELIMITER {
            break;
        }
        read += 1;

        for _ in 1..code {
            let Some(&byte) = frame.get(read) else {
                return 0;
            };
            if byte == DELIMITER || write >= out.len() {
                return 0;
            }
            out[write] = byte;
            write += 1;
            read += 1;
        }

        // A zero sits between blocks unless the block was a full 0xFF run
        let more = read < frame.len() && frame[read] != DELIMITER;
        if code != MAX_BLOCK && more {
            if write >= out.len() {
                return 0;
            }
            out[write] = 0;
            write += 1;
        }
    }

    write
}

/// Allocating convenience wrapper around [`encode_into`]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; max_encoded_len(data.len())];
    let len = encode_into(data, &mut out);
    out.truncate(len);
    out
}

/// Allocating convenience wrapper around [`decode_into`]
pub fn decode(frame: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; frame.len()];
    let len = decode_into(frame, &mut out);
    out.truncate(len);
    out
}
