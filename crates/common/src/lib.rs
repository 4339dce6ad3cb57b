// nextdesk-common: wire vocabulary shared by the relay and its clients

pub mod protocol;
