use crate::{
    Connection, Error, Keyspace, Pool, QueryOptions, QueryResult,
    protocol::{Request, Response},
};

/// Operations served by either a single [`Connection`] or a [`Pool`].
///
/// A pool forwards each call to one connection picked by
/// [`Pool::get_connection`] and fails with [`Error::NoAvailableNodes`] when
/// none is left.
pub trait Client {
    fn execute(&self, request: Request) -> Result<Response, Error>;

    fn execute_query(&self, query: &[u8], options: &QueryOptions) -> Result<QueryResult, Error>;

    fn use_keyspace(&self, name: &str) -> Result<Keyspace, Error>;

    fn cql(&self, query: &str) -> Result<QueryResult, Error> {
        self.execute_query(query.as_bytes(), &QueryOptions::default())
    }
}

impl Client for Connection {
    fn execute(&self, request: Request) -> Result<Response, Error> {
        Connection::execute(self, request)
    }

    fn execute_query(&self, query: &[u8], options: &QueryOptions) -> Result<QueryResult, Error> {
        Connection::execute_query(self, query, options)
    }

    fn use_keyspace(&self, name: &str) -> Result<Keyspace, Error> {
        Connection::use_keyspace(self, name)
    }
}

impl Client for Pool {
    fn execute(&self, request: Request) -> Result<Response, Error> {
        self.checkout()?.execute(request)
    }

    fn execute_query(&self, query: &[u8], options: &QueryOptions) -> Result<QueryResult, Error> {
        self.checkout()?.execute_query(query, options)
    }

    /// Unlike the other calls this reaches every live connection.
    fn use_keyspace(&self, name: &str) -> Result<Keyspace, Error> {
        Pool::use_keyspace(self, name)
    }
}
