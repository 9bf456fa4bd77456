//! Mocks and fixtures shared by weft's tests.

pub mod fixtures;
pub mod mock_human;
pub mod mock_llm;
pub mod mock_surface;

pub use fixtures::{temp_config, DIAMOND_PLAN, FOREACH_PLAN};
pub use mock_human::MockHuman;
pub use mock_llm::{MockLlm, MockReply, MockRequest};
pub use mock_surface::{MockElement, MockSurface};
