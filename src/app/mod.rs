pub use application::Application;

mod application;
