use rand::distributions::Alphanumeric;
use rand::Rng;

/// Topic prefix of streaming responses
pub const DATA_PREFIX: &str = "d_";

pub const HANDLE_LEN: usize = 5;

/// Random ASCII alphanumeric sequence of `len` characters
pub fn gen_randseq(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh task handle, `d_` followed by five alphanumerics
pub fn new_handle() -> String {
    format!("{}{}", DATA_PREFIX, gen_randseq(HANDLE_LEN))
}

pub fn is_data_topic(topic: &str) -> bool {
    topic.starts_with(DATA_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_shape() {
        let handle = new_handle();
        assert_eq!(handle.len(), DATA_PREFIX.len() + HANDLE_LEN);
        assert!(is_data_topic(&handle));
        assert!(handle[2..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!is_data_topic("list_collections"));
    }
}
