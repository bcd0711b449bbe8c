pub mod time;

const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate an opaque 21-character identifier (run ids, request ids).
pub fn longid() -> String {
    nanoid::nanoid!(21, &ID_ALPHABET)
}

/// Generate a short 8-character identifier (log correlation).
#[allow(unused)]
pub fn shortid() -> String {
    nanoid::nanoid!(8, &ID_ALPHABET)
}
