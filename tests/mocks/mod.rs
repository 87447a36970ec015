mod mock_upstream;

pub use self::mock_upstream::MockUpstream;
